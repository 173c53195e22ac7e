pub mod certificate;
pub mod certificate_manager;
pub mod challenge;
pub mod renewal;
pub mod router;

pub use certificate::{AccountRecord, CertificateRecord, IssuanceSource};
pub use certificate_manager::{CertificateManager, EnsureError, ManagerSettings};
pub use challenge::ChallengeManager;
pub use renewal::RenewalScheduler;
pub use router::{DomainEntry, SiteRouter};
