//! Domain events raised by the restaurant service.
//!
//! The set of events is closed on purpose: adding one means adding a
//! variant here, a wire record and schema in `encoder`, and nothing else.

/// Aggregate type stored on every outbox row emitted by this service.
pub const AGGREGATE_TYPE: &str = "Restaurant";

#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MenuItem {
    pub id: i16,
    pub name: String,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Menu {
    pub items: Vec<MenuItem>,
}

/// A snapshot of the restaurant aggregate as carried by events.
#[derive(Debug, Clone, PartialEq)]
pub struct Restaurant {
    pub id: u64,
    pub name: String,
    pub address: Address,
    pub menu: Menu,
}

/// Everything the restaurant service announces to the outside world.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    RestaurantCreated(Restaurant),
    RestaurantDeleted { restaurant_id: u64 },
    RestaurantMenuUpdated { restaurant_id: u64, menu: Menu },
}

impl DomainEvent {
    /// The type tag stored on the outbox row. The dispatch topic is
    /// derived from it.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::RestaurantCreated(_) => "RestaurantCreated",
            DomainEvent::RestaurantDeleted { .. } => "RestaurantDeleted",
            DomainEvent::RestaurantMenuUpdated { .. } => "RestaurantMenuUpdated",
        }
    }

    /// The owning aggregate's id as a decimal string. Doubles as the
    /// broker partition key so events of one restaurant stay ordered.
    pub fn aggregate_id(&self) -> String {
        match self {
            DomainEvent::RestaurantCreated(restaurant) => restaurant.id.to_string(),
            DomainEvent::RestaurantDeleted { restaurant_id }
            | DomainEvent::RestaurantMenuUpdated { restaurant_id, .. } => restaurant_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_matches_variant() {
        let deleted = DomainEvent::RestaurantDeleted { restaurant_id: 9 };
        let updated = DomainEvent::RestaurantMenuUpdated {
            restaurant_id: 9,
            menu: Menu { items: vec![] },
        };

        assert_eq!(deleted.event_type(), "RestaurantDeleted");
        assert_eq!(updated.event_type(), "RestaurantMenuUpdated");
    }

    #[test]
    fn aggregate_id_is_the_decimal_restaurant_id() {
        let event = DomainEvent::RestaurantDeleted { restaurant_id: 42 };
        assert_eq!(event.aggregate_id(), "42");
    }
}
