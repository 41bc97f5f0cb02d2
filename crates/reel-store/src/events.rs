// SPDX-License-Identifier: MIT OR Apache-2.0
//! JSONL event-log readers.

use crate::StoreError;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{BufRead, BufReader, Lines};
use std::marker::PhantomData;
use std::path::PathBuf;

/// An ordered, oldest-first iterator over one JSONL event log.
///
/// Each call to the store's `stream_*` methods opens a fresh stream, so
/// iteration is restartable. A log that does not exist yet yields nothing.
#[derive(Debug)]
pub struct EventStream<T> {
    lines: Option<Lines<BufReader<fs::File>>>,
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> EventStream<T> {
    pub(crate) fn open(path: PathBuf) -> Result<Self, StoreError> {
        let lines = match fs::File::open(&path) {
            Ok(file) => Some(BufReader::new(file).lines()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source: e,
                });
            }
        };
        Ok(Self {
            lines,
            path,
            _marker: PhantomData,
        })
    }
}

impl<T: DeserializeOwned> Iterator for EventStream<T> {
    type Item = Result<T, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let lines = self.lines.as_mut()?;
        loop {
            match lines.next()? {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Some(serde_json::from_str(&line).map_err(StoreError::Json));
                }
                Err(e) => {
                    return Some(Err(StoreError::Io {
                        path: self.path.display().to_string(),
                        source: e,
                    }));
                }
            }
        }
    }
}
