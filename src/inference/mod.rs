//! Direction, identity, and tenant inference over a call's CDRs and CELs.

pub mod direction;
pub mod numbers;
pub mod tenant;
pub mod names;
pub mod patterns;

pub use direction::{classify_direction, Direction};
pub use numbers::{is_extension, normalize_number, is_international};
pub use tenant::extract_tenant;
pub use names::extract_names;

use serde::{Deserialize, Serialize};

/// The extracted identity attributes of a call, before they are folded into a document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallIdentity {
    pub direction: Option<Direction>,
    pub src_number: Option<String>,
    pub src_extension: Option<String>,
    pub src_name: Option<String>,
    pub dst_number: Option<String>,
    pub dst_extension: Option<String>,
    pub dst_name: Option<String>,
    pub tenant: Option<String>,
    pub likely_forwarded: bool,
}
