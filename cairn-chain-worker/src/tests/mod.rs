// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

mod scenarios_basic;
mod scenarios_deferred;
mod scenarios_features;
mod scenarios_forks;
mod scenarios_irreversible_mode;
mod scenarios_producers;
mod scenarios_restart;
mod scenarios_signals;
mod scenarios_snapshot;
mod scenarios_transactions;
pub mod tools;
