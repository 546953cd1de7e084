//! Type-to-route-key resolution.
//!
//! Every dispatched request or event type carries a stable tag through
//! [`Routable`]. The [`RouteResolver`] maps that tag to the routing key used on
//! the broker, optionally through an override table for renames and
//! versioning. Producers and consumers compute keys independently; two
//! resolvers built from the same table always agree.

use std::collections::HashMap;

use serde::Deserialize;

/// A type with a stable broker identity.
pub trait Routable {
    /// Stable tag, e.g. `"orders.place-order"`.
    const ROUTE_KEY: &'static str;
}

/// Routing configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Tag → route key overrides.
    pub overrides: HashMap<String, String>,
}

/// Resolves route keys from type tags.
#[derive(Debug, Clone, Default)]
pub struct RouteResolver {
    overrides: HashMap<String, String>,
}

impl RouteResolver {
    /// Resolver without overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver built from configuration.
    pub fn from_config(config: &RoutingConfig) -> Self {
        Self {
            overrides: config.overrides.clone(),
        }
    }

    /// Add an override for a tag.
    pub fn with_override(mut self, tag: impl Into<String>, route_key: impl Into<String>) -> Self {
        self.overrides.insert(tag.into(), route_key.into());
        self
    }

    /// Route key for a tag.
    pub fn resolve(&self, tag: &str) -> String {
        self.overrides
            .get(tag)
            .cloned()
            .unwrap_or_else(|| tag.to_string())
    }

    /// Route key for a type.
    pub fn route_key<T: Routable + ?Sized>(&self) -> String {
        self.resolve(T::ROUTE_KEY)
    }
}
