//! Bull Monitor queue discovery
//!
//! Keeps a live inventory of the queues stored under the watched prefixes:
//! - `ReconciliationScanner`: full scans on connect, reconnect and on a timer
//! - `NotificationListener`: incremental Add/Remove from keyspace notifications
//! - `QueueRegistry`: the inventory, mutated only under the mutation guard
//! - `ConnectionLifecycleManager`: drives all of the above from connection events
//! - `EventPublisher`: lifecycle events for metrics and dashboards
//!
//! Redis access sits behind the `AdminStore`/`NotificationStore` ports; the
//! adapters in [`redis_store`] implement them, [`memory`] provides in-memory stand-ins.

pub mod configurer;
pub mod engine;
pub mod engine_metrics;
pub mod error;
pub mod events;
pub mod guard;
pub mod handle;
pub mod inventory;
pub mod job_events;
pub mod lifecycle;
pub mod listener;
pub mod memory;
pub mod reconcile;
pub mod redis_store;
pub mod registry;
pub mod scanner;
pub mod store;

pub use configurer::{ConfigureOutcome, KeyspaceNotificationConfigurer};
pub use engine::DiscoveryEngine;
pub use error::{DiscoveryError, Result};
pub use events::{DiscoveryEvent, EventPublisher};
pub use guard::ConcurrencyGuard;
pub use handle::{EventStreamClient, HandleFactory, JobCounts, ManagedClient, QueueClient, QueueHandle};
pub use inventory::{Inventory, InventoryEntry};
pub use job_events::{JobEvent, JobEventBatch, JobEventKind, JobRecord};
pub use lifecycle::{ConnectionLifecycleManager, EngineStatus, LifecycleSettings};
pub use listener::{ChangeKind, ChangeNotification, NotificationListener};
pub use reconcile::{ReconcileTrigger, ReconciliationReport, ReconciliationSnapshot, Reconciler};
pub use registry::{QueueRegistry, RemovalReason};
pub use scanner::ReconciliationScanner;
pub use store::{AdminStore, ConnectionState, NotificationStore, StoreEvent, StoreEventReceiver};
