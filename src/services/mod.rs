//! Service layer
//!
//! Long-lived collaborators the supervisor drives: duration probing,
//! reachability checks, release checks, schedule uploads and the mail
//! alert dispatcher. Each service owns its own state; the supervisor
//! owns their lifecycles.

pub mod connectivity;
pub mod mailer;
pub mod media_prober;
pub mod uploader;
pub mod version_check;

pub use connectivity::ConnectionProber;
pub use mailer::{Alert, Mailer};
pub use media_prober::{FfprobeProber, MediaProber};
pub use uploader::{FileTransport, RemoteUploader, ScpTransport, TransportError};
pub use version_check::{ReleaseInfo, VersionCheckOutcome, VersionProber};
