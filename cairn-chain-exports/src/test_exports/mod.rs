// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

mod executor;

pub use crate::signals::MockChainListener;
pub use executor::*;
