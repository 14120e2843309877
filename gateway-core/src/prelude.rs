//! gateway prelude

pub use crate::{
    anyhow::{self, Context, Result},
    async_trait,
    config::cli::{Config, StoreBackend},
    tokio,
    tokio_util::sync::CancellationToken,
    tracing::{self, debug, error, info, instrument, trace, warn},
};

pub use std::{io, sync::Arc};
