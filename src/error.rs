/* Copyright (C) 2024 Philipp Benner
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

use std::io;

use thiserror::Error;

/* -------------------------------------------------------------------------- */

// Errors shared by all file formats in this crate
#[derive(Error, Debug)]
pub enum BigFileError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid {0}")]
    Format(&'static str),

    #[error("read past end of region")]
    Truncated,

    #[error("unsupported file version {0}")]
    UnsupportedVersion(u16),

    #[error("unsupported compression method")]
    UnsupportedCompression,

    #[error("magic number does not match any supported byte order")]
    BadSignature,

    #[error("input violates sort order: {0}")]
    SortOrder(String),

    #[error("duplicate key `{0}`")]
    DuplicateKey(String),

    #[error("`{0}` not found")]
    NoSuchElement(String),
}

/* -------------------------------------------------------------------------- */

pub type Result<T> = std::result::Result<T, BigFileError>;
