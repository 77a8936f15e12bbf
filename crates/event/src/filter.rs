use std::sync::Arc;

use bitscrape_types::{Event, EventTag};

/// Composable predicate over events, evaluated with short-circuiting.
/// Filters attach to processors rather than subscriptions, so several
/// processors can slice the same bus differently.
#[derive(Clone)]
pub enum EventFilter {
    Tag(EventTag),
    Predicate(Arc<dyn Fn(&Event) -> bool + Send + Sync>),
    And(Box<EventFilter>, Box<EventFilter>),
    Or(Box<EventFilter>, Box<EventFilter>),
    Not(Box<EventFilter>),
}

impl EventFilter {
    pub fn tag(tag: EventTag) -> Self {
        EventFilter::Tag(tag)
    }

    pub fn predicate(f: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        EventFilter::Predicate(Arc::new(f))
    }

    pub fn and(self, other: EventFilter) -> Self {
        EventFilter::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: EventFilter) -> Self {
        EventFilter::Or(Box::new(self), Box::new(other))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        EventFilter::Not(Box::new(self))
    }

    pub fn matches(&self, event: &Event) -> bool {
        match self {
            EventFilter::Tag(tag) => event.tag() == *tag,
            EventFilter::Predicate(f) => f(event),
            EventFilter::And(a, b) => a.matches(event) && b.matches(event),
            EventFilter::Or(a, b) => a.matches(event) || b.matches(event),
            EventFilter::Not(inner) => !inner.matches(event),
        }
    }
}

impl std::fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventFilter::Tag(tag) => write!(f, "Tag({tag:?})"),
            EventFilter::Predicate(_) => f.write_str("Predicate(..)"),
            EventFilter::And(a, b) => write!(f, "And({a:?}, {b:?})"),
            EventFilter::Or(a, b) => write!(f, "Or({a:?}, {b:?})"),
            EventFilter::Not(inner) => write!(f, "Not({inner:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitscrape_types::{EventPayload, InfoHash};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn discovered() -> Event {
        Event::new(EventPayload::InfoHashDiscovered {
            info_hash: InfoHash::random(),
            source: "127.0.0.1:6881".parse().unwrap(),
        })
    }

    fn degraded() -> Event {
        Event::new(EventPayload::SessionDegraded {
            reason: "test".into(),
        })
    }

    #[test]
    fn combinators() {
        let f = EventFilter::tag(EventTag::InfoHashDiscovered)
            .or(EventFilter::tag(EventTag::PeerDiscovered));
        assert!(f.matches(&discovered()));
        assert!(!f.matches(&degraded()));
        assert!(f.clone().not().matches(&degraded()));

        let never = EventFilter::tag(EventTag::Log).and(EventFilter::predicate(|_| true));
        assert!(!never.matches(&discovered()));
    }

    #[test]
    fn and_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let f = EventFilter::tag(EventTag::Log).and(EventFilter::predicate(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
            true
        }));
        assert!(!f.matches(&discovered()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
