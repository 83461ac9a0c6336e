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

use tracing_subscriber::EnvFilter;

/// Create an environment filter based on verbosity level
pub fn create_env_filter(verbosity: u8) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        // Use RUST_LOG if set (allows debugging russh and other dependencies)
        EnvFilter::from_default_env()
    } else {
        match verbosity {
            0 => EnvFilter::new("blower=warn"),
            1 => EnvFilter::new("blower=info"),
            // -vv: include russh debug logs for SSH troubleshooting
            2 => EnvFilter::new("blower=debug,russh=debug"),
            _ => EnvFilter::new("blower=trace,russh=trace"),
        }
    }
}

/// Install a console subscriber for the hosting program.
///
/// Span nesting (`run`, `sh`, `host`, ...) replaces manual indentation.
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(verbosity: u8) {
    let filter = create_env_filter(verbosity);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_env_filter() {
        // Test verbosity levels create valid filters
        let _ = create_env_filter(0);
        let _ = create_env_filter(1);
        let _ = create_env_filter(2);
        let _ = create_env_filter(3);
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging(1);
        init_logging(2);
    }
}
