// Copyright (c) 2024 CAIRN LABS <info@cairn.dev>

use displaydoc::Display;
use thiserror::Error;

/// Hash error
#[non_exhaustive]
#[derive(Display, Error, Debug, Clone)]
pub enum HashError {
    /// parsing error: {0}
    ParsingError(String),
    /// Wrong size: expected {0} bytes, got {1}
    WrongSize(usize, usize),
}
