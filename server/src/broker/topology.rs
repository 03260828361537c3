//! Broker Topology
//!
//! The declaration plan is a pure function of the process lane and the
//! logical queue list. Queue names and routing keys are always derived by
//! suffixing; they are never stored.

use std::time::Duration;

use lane_common::{is_feature_lane, lane_queue, lane_routing_key};

/// Main delayed-message exchange (topic routed).
pub const EXCHANGE_NAME: &str = "post_processing";

/// Dead-letter exchange (fanout).
pub const DLX_NAME: &str = "post_processing_dlx";

/// Dead-letter queue.
pub const DLQ_NAME: &str = "dead_letters";

pub const QUEUE_RECALL: &str = "recall";
pub const QUEUE_VECTORIZE: &str = "vectorize";
pub const RK_RECALL: &str = "action.recall";
pub const RK_VECTORIZE: &str = "task.vectorize";

/// Idle expiry for feature-lane queues.
pub const NON_PROD_QUEUE_EXPIRES: Duration = Duration::from_secs(24 * 60 * 60);

/// Exchange type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Fanout,
    /// Delayed-message exchange routing like a topic exchange.
    DelayedTopic,
}

/// Exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

/// Queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// `x-dead-letter-exchange` argument.
    pub dead_letter_exchange: Option<String>,
    /// `x-expires` argument.
    pub expires: Option<Duration>,
}

/// A logical queue and the routing key base it is bound with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: &str, routing_key: &str) -> Self {
        Self {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        }
    }
}

/// One declaration, in the order it must be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyStep {
    Exchange(ExchangeSpec),
    Queue(QueueSpec),
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
}

/// The logical queues every process declares.
pub fn default_bindings() -> Vec<QueueBinding> {
    vec![
        QueueBinding::new(QUEUE_RECALL, RK_RECALL),
        QueueBinding::new(QUEUE_VECTORIZE, RK_VECTORIZE),
    ]
}

/// Ordered declaration plan: DLX, DLQ, DLQ binding, main exchange, then
/// each logical queue followed by its binding.
pub fn plan(lane: Option<&str>, bindings: &[QueueBinding]) -> Vec<TopologyStep> {
    let mut steps = vec![
        TopologyStep::Exchange(ExchangeSpec {
            name: DLX_NAME.to_string(),
            kind: ExchangeKind::Fanout,
            durable: true,
        }),
        TopologyStep::Queue(QueueSpec {
            name: DLQ_NAME.to_string(),
            durable: true,
            dead_letter_exchange: None,
            expires: None,
        }),
        TopologyStep::Bind {
            queue: DLQ_NAME.to_string(),
            exchange: DLX_NAME.to_string(),
            routing_key: String::new(),
        },
        TopologyStep::Exchange(ExchangeSpec {
            name: EXCHANGE_NAME.to_string(),
            kind: ExchangeKind::DelayedTopic,
            durable: true,
        }),
    ];

    let expires = is_feature_lane(lane).then_some(NON_PROD_QUEUE_EXPIRES);

    for binding in bindings {
        let queue = lane_queue(&binding.queue, lane);
        steps.push(TopologyStep::Queue(QueueSpec {
            name: queue.clone(),
            durable: true,
            dead_letter_exchange: Some(DLX_NAME.to_string()),
            expires,
        }));
        steps.push(TopologyStep::Bind {
            queue,
            exchange: EXCHANGE_NAME.to_string(),
            routing_key: lane_routing_key(&binding.routing_key, lane),
        });
    }

    steps
}
