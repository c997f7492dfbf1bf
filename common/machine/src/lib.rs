// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Execution contexts for the local machine and for remote machines reached
//! over ssh, plus the process runner that executes command lines on them.

mod context;
mod runner;

pub use context::*;
pub use runner::*;
