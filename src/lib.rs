// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod app;
pub mod channel;
pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod queue;
pub mod shutdown;
pub mod topology;
