// ABOUTME: Configuration management module
// ABOUTME: Environment-driven server configuration
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

/// Environment-based server configuration
pub mod environment;
