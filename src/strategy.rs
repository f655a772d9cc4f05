//! Request classification.
//!
//! Routing is decided once per request, before any I/O. Rule order matters:
//! the auth exclusion comes first so that nothing under `/api/auth/` is ever
//! cached, even an image. Static assets and fonts are checked before the
//! general API rule.

use url::Url;

use crate::cache::Partition;
use crate::config::Config;
use crate::http::Request;

/// URL schemes owned by browser extensions.
const EXTENSION_SCHEMES: &[&str] = &[
  "chrome-extension",
  "moz-extension",
  "safari-extension",
  "safari-web-extension",
  "ms-browser-extension",
];

/// Where a request is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not intercepted at all (non-GET, extension scheme)
  Bypass,
  /// Precached shell asset or icon/image
  Static,
  /// Third-party font
  Font,
  /// Authenticated endpoint, network only
  AuthPassthrough,
  /// Data endpoint
  Api,
  /// Any other same-origin request
  AppShell,
  /// Cross-origin, uncategorized
  External,
}

/// Policy applied to a routed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  NotIntercepted,
  CacheFirst(Partition),
  NetworkFirst(Partition),
  /// Intercepted, but always fetched and never stored
  Network,
}

impl Route {
  pub fn strategy(&self) -> Strategy {
    match self {
      Route::Bypass => Strategy::NotIntercepted,
      Route::Static => Strategy::CacheFirst(Partition::Static),
      Route::Font => Strategy::CacheFirst(Partition::Dynamic),
      Route::AuthPassthrough => Strategy::Network,
      Route::Api => Strategy::NetworkFirst(Partition::Api),
      Route::AppShell => Strategy::NetworkFirst(Partition::Dynamic),
      Route::External => Strategy::Network,
    }
  }
}

/// Classifies requests against one worker configuration.
#[derive(Debug, Clone)]
pub struct StrategySelector {
  origin: Url,
  precache: Vec<String>,
  font_origins: Vec<String>,
  api_prefix: String,
  auth_prefix: String,
}

impl StrategySelector {
  pub fn new(config: &Config) -> Self {
    Self {
      origin: config.origin.clone(),
      precache: config.precache.clone(),
      font_origins: config.font_origins.clone(),
      api_prefix: config.api_prefix.clone(),
      auth_prefix: config.auth_prefix.clone(),
    }
  }

  pub fn classify(&self, request: &Request) -> Route {
    let url = &request.url;

    if request.method != "GET" || EXTENSION_SCHEMES.contains(&url.scheme()) {
      return Route::Bypass;
    }

    let same_origin = url.origin() == self.origin.origin();
    let path = url.path();

    if same_origin && path.starts_with(&self.auth_prefix) {
      return Route::AuthPassthrough;
    }

    if same_origin && (self.precache.iter().any(|p| p == path) || is_image_asset(path)) {
      return Route::Static;
    }

    if let Some(host) = url.host_str() {
      if self.font_origins.iter().any(|f| f == host) {
        return Route::Font;
      }
    }

    if !same_origin {
      return Route::External;
    }

    if path.starts_with(&self.api_prefix) {
      return Route::Api;
    }

    Route::AppShell
  }
}

/// `/icon-*`, `*.png` and `*.ico`.
fn is_image_asset(path: &str) -> bool {
  let lower = path.to_ascii_lowercase();
  lower.starts_with("/icon-") || lower.ends_with(".png") || lower.ends_with(".ico")
}
