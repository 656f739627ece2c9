//! Local container engine driver, backed by the Docker API via `bollard`.

pub mod client;
pub mod container;
pub mod driver_impl;
pub mod image;
pub mod inventory;
pub mod network;
pub mod volume;

pub use client::{DockerClient, DockerError};
pub use driver_impl::DockerDriver;
