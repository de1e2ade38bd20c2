#![allow(clippy::all)]

include!("api/eventbus.v1.rs");
