//! Provisioning and teardown of isolated, single-job build workers
//!
//! Each worker gets a root filesystem from a content-addressed cache, a
//! scratch volume, a private device filesystem with its own loop devices,
//! and optionally a network link, all owned by one [Worker] and torn down in
//! reverse order when it closes.

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("corral only works on linux or android");

#[macro_use] extern crate lazy_static;

pub mod abort;
pub mod archive;
pub mod cache;
pub mod cgroup;
pub mod command;
pub mod config;
pub mod container;
pub mod devfs;
pub mod errors;
pub mod handshake;
pub mod installer;
pub mod lock;
pub mod loopdev;
pub mod manifest;
pub mod mount;
pub mod network;
pub mod resource;
pub mod subprocess;
pub mod volume;
pub mod worker;

pub use crate::{
    cache::RootCache,
    config::Config,
    container::Container,
    errors::Error,
    manifest::{Manifest, ManifestHash, PackageSpec},
    resource::{Resource, ResourceStack},
    worker::{Job, Provisioner, Worker},
};
