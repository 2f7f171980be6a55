//! Coin selection
//!
//! - `types.rs` - [`Selection`], [`SelectionPolicy`] and the [`Overshoot`] rule
//! - `selector.rs` - the greedy [`CoinSelector`]
//!
//! Selection is all-or-nothing: a non-empty [`Selection`] covers its target
//! (strictly exceeds it under the default [`Overshoot::Strict`] rule) and an
//! empty one means no subset of the eligible outputs, taken in order, could.

pub mod selector;
pub mod types;

pub use selector::CoinSelector;
pub use types::{Overshoot, Selection, SelectionPolicy};
