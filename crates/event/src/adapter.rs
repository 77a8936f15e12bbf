use bitscrape_types::SubscriptionToken;

use crate::bus::EventBus;

/// Connects an external collaborator (storage, beacon, tracker) to the
/// bus. `connect` registers the collaborator's handlers; `disconnect`
/// removes them. Implementations must tolerate repeated
/// connect/disconnect cycles.
pub trait EventAdapter: Send {
    fn name(&self) -> &'static str;
    fn connect(&mut self, bus: &EventBus);
    fn disconnect(&mut self, bus: &EventBus);
    fn is_connected(&self) -> bool;
}

/// Token bookkeeping shared by adapter implementations: record tokens in
/// registration order on connect, release them in reverse order on
/// disconnect.
#[derive(Default)]
pub struct AdapterTokens {
    tokens: Vec<SubscriptionToken>,
}

impl AdapterTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, token: SubscriptionToken) {
        self.tokens.push(token);
    }

    pub fn is_connected(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub fn disconnect_all(&mut self, bus: &EventBus) {
        while let Some(token) = self.tokens.pop() {
            bus.unsubscribe(token);
        }
    }
}
