//! Log Records
//!
//! A source iterator yields a stream of [`Record`]s: timestamped data
//! records in non-decreasing time order, interleaved with timeless
//! problem records (decode failures, dropped messages, and similar
//! diagnostics that should surface to the user without aborting
//! playback).
//!
//! Records with equal timestamps keep their emission order everywhere
//! in the pipeline; consumers rely on stable merges.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::time::Time;

/// How serious a [`Problem`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warn,
    Info,
}

/// A non-fatal diagnostic surfaced alongside playback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub severity: Severity,
    pub message: String,
}

impl Problem {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Problem { severity, message: message.into() }
    }
}

/// A single timestamped message on a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRecord {
    pub topic: String,
    pub time: Time,
    pub payload: Bytes,
    /// Approximate in-memory footprint, used for cache accounting.
    pub size_bytes: usize,
}

impl DataRecord {
    /// Builds a record with an estimated size (payload plus topic name
    /// plus fixed overhead).
    pub fn new(topic: impl Into<String>, time: Time, payload: Bytes) -> Self {
        let topic = topic.into();
        let size_bytes = payload.len() + topic.len() + std::mem::size_of::<Self>();
        DataRecord { topic, time, payload, size_bytes }
    }
}

/// One item from a source iterator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Data(DataRecord),
    Problem(Problem),
}

impl Record {
    /// The record's timestamp. Problem records are timeless.
    pub fn time(&self) -> Option<Time> {
        match self {
            Record::Data(d) => Some(d.time),
            Record::Problem(_) => None,
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            Record::Data(d) => d.size_bytes,
            Record::Problem(p) => p.message.len(),
        }
    }

    pub fn as_data(&self) -> Option<&DataRecord> {
        match self {
            Record::Data(d) => Some(d),
            Record::Problem(_) => None,
        }
    }
}
