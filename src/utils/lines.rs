// Copyright 2025 Lablup Inc. and Jeongkyu Shin
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

//! Splits streamed channel data into complete lines for logging.

/// Accumulates bytes and hands out complete lines, keeping any trailing
/// partial line until more data (or [`LineBuffer::finish`]) arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append data and return every line completed by it, without terminators.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);

        let Some(last_break) = self.pending.iter().rposition(|&b| b == b'\n' || b == b'\r')
        else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_break + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        complete
            .split(|&b| b == b'\n' || b == b'\r')
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    /// Flush the trailing partial line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_chunks() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"hel").is_empty());
        assert_eq!(buffer.push(b"lo\nwor"), vec!["hello"]);
        assert_eq!(buffer.push(b"ld\r\nbye\n"), vec!["world", "bye"]);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_finish_returns_partial_line() {
        let mut buffer = LineBuffer::new();
        buffer.push(b"no newline");
        assert_eq!(buffer.finish().as_deref(), Some("no newline"));
        assert_eq!(buffer.finish(), None);
    }
}
