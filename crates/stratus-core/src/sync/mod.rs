pub mod coordinator;
pub mod profiles;
pub mod reconcile;
pub mod send;

pub use coordinator::{FanInCoordinator, SubscriptionState};
pub use profiles::ProfileEnricher;
pub use reconcile::PushReconciler;
pub use send::SendCoordinator;
