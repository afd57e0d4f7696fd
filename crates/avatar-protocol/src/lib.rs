//! Avatar wire protocol
//!
//! Identity spaces, entity keys and the three cross-boundary events
//! exchanged between the avatar engine and presentation-tier clients.
//! TypeScript bindings are generated with `ts-rs`.

mod events;
mod key;

pub use events::{
    AvatarFetch, AvatarPrimeCache, AvatarResolved, ClientEvent, ServerEvent, AVATAR_FETCH,
    AVATAR_PRIME_CACHE, AVATAR_RESOLVED,
};
pub use key::{EntityKey, ParseSpaceError, Space};
