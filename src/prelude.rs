pub use tracing::{debug, info, trace, warn};

pub use crate::error::{Result, StoreError};
