//! Builds container images from declarative recipes as a strictly linear
//! pipeline of steps, with a content-addressed layer cache.

pub mod archive;
pub mod backends;
pub mod builder;
pub mod containerfile;
pub mod context;
pub mod error;
pub mod frontends;
pub mod hasher;
pub mod manifest;
pub mod models;
pub mod recipe;
pub mod services;
pub mod store;
