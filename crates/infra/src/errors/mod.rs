//! Error conversions for infrastructure adapters

mod conversions;

pub(crate) use conversions::{IntoStoreError, IntoUpstreamError};
