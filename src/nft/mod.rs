// Copyright (c) 2026 kalwalt and AR.js-org contributors
//
// This software is released under the MIT License.
// https://opensource.org/licenses/MIT
// See https://github.com/AR-js-org/aruco-rs/blob/main/LICENSE
// src/nft/mod.rs
pub mod cluster;
pub mod dataset;
pub mod descriptor;
pub mod features;
pub mod homography;
pub mod hough;
pub mod template;
pub mod tracker;
