// SPDX-License-Identifier: Apache-2.0

// Backend drivers

pub mod mysql;
pub mod postgres;
pub mod shopify;
pub mod sql_common;
pub mod sqlite;
