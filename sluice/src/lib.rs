#![doc(issue_tracker_base_url = "https://github.com/sluice-rs/sluice/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use sluice_event::*;
pub use sluice_limit::*;
pub use sluice_socket::*;
