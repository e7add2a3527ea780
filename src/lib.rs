// Local inference host for OpenVINO generative models.
//
// The same binary serves three roles: the HTTP/SSE control plane, the
// isolated inference worker (--worker), and the download child
// (--download). Everything below is shared between them.

pub mod app_config;
pub mod download;
pub mod events;
pub mod i18n;
pub mod logger;
pub mod models;
pub mod paths;
pub mod request_parsing;
pub mod response_helpers;
pub mod routes;
pub mod scanner;
pub mod session;
pub mod settings;
pub mod telemetry;
pub mod worker;
