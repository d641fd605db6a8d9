// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The two routing tables: local receivers and cluster peers

pub mod external;
pub mod internal;
