pub mod helpers;

use async_trait::async_trait;
use librarian_error::LibrarianError;

/// # Description
/// A trait for configuring a struct from a config object.
/// # Notes
/// This trait is used to configure structs from the config object.
/// Components that need to be configured from the config object should implement this trait.
#[async_trait]
pub trait Configurable<T, E = Box<dyn LibrarianError>> {
    async fn try_from_config(config: &T) -> Result<Self, E>
    where
        Self: Sized;
}
