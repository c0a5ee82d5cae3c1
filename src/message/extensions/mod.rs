pub mod ec_point_formats;
pub mod signature_algorithms;
pub mod supported_groups;

pub use ec_point_formats::{EcPointFormat, EcPointFormatsExtension};
pub use signature_algorithms::SignatureAlgorithmsExtension;
pub use supported_groups::{select_named_group, SupportedGroupsExtension};
