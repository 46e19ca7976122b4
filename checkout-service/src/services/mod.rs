pub mod access;
pub mod metrics;
pub mod payments;
pub mod phonepe;
pub mod reporting;
pub mod repository;

pub use access::AccessGate;
pub use metrics::{get_metrics, init_metrics};
pub use payments::PaymentOrchestrator;
pub use phonepe::{PaymentGateway, PhonePeClient};
pub use reporting::Reporting;
pub use repository::{EntitlementStore, ItemCatalog, MemoryStore, MongoStore, TransactionStore};
