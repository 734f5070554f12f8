use std::io;

use tracing::debug;

/// Source of the container ID used for origin detection.
///
/// When the client runs in a container, the Datadog Agent can use the container ID attached to each packet to enrich
/// metrics with container-level tags. Discovering the ID is platform-specific (typically by inspecting the cgroup
/// hierarchy), so it is left to implementations of this trait.
///
/// It is implemented for any `Fn() -> io::Result<Option<String>>` closure.
pub trait ContainerIdProvider: Send + Sync {
    /// Returns the ID of the container the process is running in.
    ///
    /// `Ok(None)` means the process is not running in a container.
    ///
    /// # Errors
    ///
    /// If the container ID cannot be determined, an error should be returned. It is logged, and no container ID is
    /// attached.
    fn container_id(&self) -> io::Result<Option<String>>;
}

impl<F> ContainerIdProvider for F
where
    F: Fn() -> io::Result<Option<String>> + Send + Sync,
{
    fn container_id(&self) -> io::Result<Option<String>> {
        self()
    }
}

/// Resolves the container ID, preferring an explicitly configured one over the provider.
pub(crate) fn resolve_container_id(
    explicit: Option<String>,
    provider: Option<&dyn ContainerIdProvider>,
) -> Option<String> {
    if explicit.is_some() {
        return explicit;
    }

    match provider?.container_id() {
        Ok(Some(container_id)) if !container_id.is_empty() => Some(container_id),
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "Failed to detect container ID, origin detection disabled.");
            None
        }
    }
}
