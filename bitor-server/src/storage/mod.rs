pub mod presign;

pub use presign::{ArchivePresigner, PresignError, SIGNED_URL_TTL};
