pub mod podman;

pub use podman::PodmanBackend;
