use thiserror::Error;

use crate::binding::RegistryError;
use crate::config::ConfigError;
use crate::core::CoreError;
use crate::proto::CodecError;
use crate::session::SessionError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the capability errors of
/// the individual modules.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
