// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request handlers, grouped by resource.

pub mod agents;
pub mod health;
pub mod tasks;
