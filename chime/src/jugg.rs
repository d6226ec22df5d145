//! Push event router.
//!
//! The juggernaut feed multiplexes every subscribed channel over one
//! connection. The [`JuggRouter`] maps `(channel, kind)` interest onto
//! caller-supplied route tags and tracks per-channel refcounts so that the
//! transport joins a channel exactly when its first subscriber appears and
//! leaves it when its last subscriber goes.
//!
//! Routing is deliberately dumb: the router hands back the matching tags
//! and the caller dispatches. Nothing in here re-enters the structures
//! being routed to.

use std::collections::HashMap;

use tracing::trace;

use chime_proto::event::PushEvent;

/// What a subscribe or unsubscribe did to the underlying channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelTransition {
    /// First subscriber: the transport should join the channel.
    Joined,
    /// Last subscriber gone: the transport should leave the channel.
    Left,
    /// Refcount moved but no join or leave is needed.
    None,
}

struct Subscription<R> {
    /// Event kind this subscription wants, or `None` for every kind.
    filter: Option<String>,
    route: R,
}

/// Routing table from push channels to route tags.
pub struct JuggRouter<R> {
    channels: HashMap<String, Vec<Subscription<R>>>,
}

impl<R: Clone + PartialEq> JuggRouter<R> {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    /// Registers interest in `kind` events on `channel` (all kinds when
    /// `kind` is `None`). Subscribing the same `(channel, kind, route)`
    /// tuple twice is a no-op.
    pub fn subscribe(
        &mut self,
        channel: &str,
        kind: Option<&str>,
        route: R,
    ) -> ChannelTransition {
        let subs = self.channels.entry(channel.to_string()).or_default();
        let duplicate = subs
            .iter()
            .any(|s| s.filter.as_deref() == kind && s.route == route);
        if duplicate {
            return ChannelTransition::None;
        }
        let first = subs.is_empty();
        subs.push(Subscription {
            filter: kind.map(str::to_string),
            route,
        });
        trace!(channel, kind, first, "push subscription added");
        if first {
            ChannelTransition::Joined
        } else {
            ChannelTransition::None
        }
    }

    /// Removes the `(channel, kind, route)` subscription if present.
    /// Unsubscribing something never subscribed is a no-op.
    pub fn unsubscribe(
        &mut self,
        channel: &str,
        kind: Option<&str>,
        route: &R,
    ) -> ChannelTransition {
        let Some(subs) = self.channels.get_mut(channel) else {
            return ChannelTransition::None;
        };
        let before = subs.len();
        subs.retain(|s| !(s.filter.as_deref() == kind && s.route == *route));
        if subs.len() == before {
            return ChannelTransition::None;
        }
        if subs.is_empty() {
            self.channels.remove(channel);
            trace!(channel, "last push subscription removed");
            ChannelTransition::Left
        } else {
            ChannelTransition::None
        }
    }

    /// Removes every subscription carrying `route`, across all channels.
    /// Returns the channels whose last subscriber this was.
    pub fn unsubscribe_route(&mut self, route: &R) -> Vec<String> {
        let mut left = Vec::new();
        self.channels.retain(|channel, subs| {
            subs.retain(|s| s.route != *route);
            if subs.is_empty() {
                left.push(channel.clone());
                false
            } else {
                true
            }
        });
        left
    }

    /// Returns the route tags interested in `event`, in subscription order.
    #[must_use]
    pub fn routes_for(&self, event: &PushEvent) -> Vec<R> {
        self.channels
            .get(&event.channel)
            .map(|subs| {
                subs.iter()
                    .filter(|s| s.filter.as_deref().is_none_or(|k| k == event.kind))
                    .map(|s| s.route.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether any subscription exists for `channel`.
    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }
}

impl<R: Clone + PartialEq> Default for JuggRouter<R> {
    fn default() -> Self {
        Self::new()
    }
}
