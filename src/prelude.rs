pub(crate) use anyhow::Context;
pub(crate) use tracing::{debug, debug_span, error, info, instrument, trace, warn};
