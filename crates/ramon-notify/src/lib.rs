pub mod aggregator;
pub mod message;
pub mod notifier;
pub mod providers;
pub mod scheduler;

pub use aggregator::{combine, NotificationAggregator};
pub use message::{AggregateMode, DeliveryTarget, Notification, NotifyConfig};
pub use notifier::{Notifier, NotifyResult};
pub use providers::{EmailNotifier, LogNotifier, PushBulletNotifier, TargetRouter};
pub use scheduler::CronFlushScheduler;
