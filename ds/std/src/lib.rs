// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    sync::Mutex,
};

use hpfs_ds::{DataStorage, Error, Result};

/// A `DataStorage` backed by a regular file, addressed by byte offset.
pub struct FileBackedStorage {
    file: File,
    read_only: bool,
}

impl FileBackedStorage {
    pub fn open(file_path: &str) -> Result<Self> {
        let file = File::open(file_path).map_err(Error::Io)?;
        Ok(Self {
            file,
            read_only: true,
        })
    }

    pub fn open_read_write(file_path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(file_path)
            .map_err(Error::Io)?;
        Ok(Self {
            file,
            read_only: false,
        })
    }
}

impl DataStorage for FileBackedStorage {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buffer, offset).map_err(Error::Io)
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.file.write_all_at(buffer, offset).map_err(Error::Io)
    }
}

/// An in-memory `DataStorage`, grown on demand. Used by tests that exercise
/// the allocation core without a backing file.
pub struct MemStorage {
    data: Mutex<Vec<u8>>,
}

impl MemStorage {
    pub fn new(size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; size]),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }
}

impl DataStorage for MemStorage {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start + buffer.len();
        if end > data.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of storage",
            )));
        }
        buffer.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start + buffer.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buffer);
        Ok(())
    }
}
