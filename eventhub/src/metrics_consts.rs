// ==== Client factory ====
/// Counter for broker clients constructed, labelled by kind (producer, consumer)
pub const CLIENTS_CREATED: &str = "eventhub_clients_created_total";

/// Gauge for processor groups currently tracked by the factory
pub const PROCESSOR_GROUPS_ACTIVE: &str = "eventhub_processor_groups_active";

/// Counter for checkpoint containers created during provisioning
pub const CONTAINERS_PROVISIONED: &str = "eventhub_checkpoint_containers_provisioned_total";

/// Counter for resources that failed to close during shutdown
pub const CLOSE_FAILURES: &str = "eventhub_close_failures_total";

// ==== Send path ====
/// Counter for sends, labelled by outcome and routing
pub const EVENTS_SENT: &str = "eventhub_events_sent_total";

// ==== Delivery path ====
/// Counter for events delivered by processor groups
pub const EVENTS_DELIVERED: &str = "eventhub_events_delivered_total";

/// Histogram for the size of delivered batches
pub const BATCH_SIZE: &str = "eventhub_delivered_batch_size";

/// Gauge for local consumers registered per entity
pub const LOCAL_CONSUMERS: &str = "eventhub_local_consumers";

/// Counter for processor errors reported by the broker
pub const PROCESSOR_ERRORS: &str = "eventhub_processor_errors_total";

/// Gauge for partitions owned by this process
pub const PARTITIONS_OWNED: &str = "eventhub_partitions_owned";

// ==== Checkpoints ====
/// Counter for checkpoint commits, labelled by outcome (ok, failed, stale, not_owned)
pub const CHECKPOINTS: &str = "eventhub_checkpoints_total";

// ==== Adapters ====
/// Counter for inbound messages, labelled by outcome
pub const INBOUND_MESSAGES: &str = "eventhub_inbound_messages_total";
