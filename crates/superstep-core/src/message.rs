// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message payload bound.

/// A vertex message: any protobuf-encodable value.
///
/// Implemented for every `prost` message and for the scalar and string types
/// prost encodes as wrappers (`u64`, `i64`, `f64`, `String`, ...).
pub trait Message: prost::Message + Default + Clone + Send + Sync + 'static {}

impl<T> Message for T where T: prost::Message + Default + Clone + Send + Sync + 'static {}
