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

use std::fmt;
use std::io::{Seek, Write};

use crate::error::Result;
use crate::ordered_output::OrderedDataOutput;
use crate::rom_buffer::RomBuffer;

/* -------------------------------------------------------------------------- */

// Running statistics over covered bases. Forms a commutative monoid
// under add(), with the empty summary as identity.
#[derive(Clone, Copy, Debug)]
pub struct BigSummary {
    pub count      : u64,
    pub min        : f64,
    pub max        : f64,
    pub sum        : f64,
    pub sum_squares: f64,
}

/* -------------------------------------------------------------------------- */

impl Default for BigSummary {
    fn default() -> Self {
        BigSummary {
            count      : 0,
            min        : f64::INFINITY,
            max        : f64::NEG_INFINITY,
            sum        : 0.0,
            sum_squares: 0.0,
        }
    }
}

/* -------------------------------------------------------------------------- */

impl BigSummary {

    pub fn reset(&mut self) {
        *self = BigSummary::default();
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    // One value covering the given number of bases
    pub fn add_value(&mut self, value: f64, bases: u64) {
        if value.is_nan() || bases == 0 {
            return;
        }
        self.count       += bases;
        self.min          = self.min.min(value);
        self.max          = self.max.max(value);
        self.sum         += value * bases as f64;
        self.sum_squares += value * value * bases as f64;
    }

    pub fn add(&mut self, other: &BigSummary) {
        if other.count == 0 {
            return;
        }
        self.count       += other.count;
        self.min          = self.min.min(other.min);
        self.max          = self.max.max(other.max);
        self.sum         += other.sum;
        self.sum_squares += other.sum_squares;
    }

    pub fn mean(&self) -> f64 {
        self.sum / self.count as f64
    }

    pub fn read(buffer: &mut RomBuffer) -> Result<BigSummary> {
        Ok(BigSummary {
            count      : buffer.get_u64()?,
            min        : buffer.get_f64()?,
            max        : buffer.get_f64()?,
            sum        : buffer.get_f64()?,
            sum_squares: buffer.get_f64()?,
        })
    }

    pub fn write<W: Write + Seek>(&self, output: &mut OrderedDataOutput<W>) -> Result<()> {
        output.write_u64(self.count)?;
        output.write_f64(self.min)?;
        output.write_f64(self.max)?;
        output.write_f64(self.sum)?;
        output.write_f64(self.sum_squares)?;
        Ok(())
    }

}

/* -------------------------------------------------------------------------- */

impl fmt::Display for BigSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(count={}, min={}, max={}, sum={}, sum_squares={})",
            self.count,
            self.min,
            self.max,
            self.sum,
            self.sum_squares)
    }
}

/* -------------------------------------------------------------------------- */
/* -------------------------------------------------------------------------- */
