// Copyright (c) 2026 kalwalt and AR.js-org contributors
//
// This software is released under the MIT License.
// https://opensource.org/licenses/MIT
// See https://github.com/AR-js-org/aruco-rs/blob/main/LICENSE
// src/core/mod.rs
pub mod camera;
pub mod detector;
pub mod frame;
pub mod history;
pub mod matrix_code;
pub mod multi;
pub mod pattern;
pub mod posit;
pub mod threshold;
pub mod transmat;
