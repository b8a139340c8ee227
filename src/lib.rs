#![forbid(unsafe_code)]
#![doc = r#"
Trustring

Issue, rotate, verify, and expire signed opaque tokens that assert a user's
identity across a cluster of otherwise stateless front-end servers — no
sticky sessions, no shared session store.

Crate highlights
- A per-process ring of rotating HMAC keys (`ring`): keys live for twice the
  token ttl and rotate every half ttl, so in-flight tokens always keep a
  verification key while memory stays bounded.
- Stateless token encode/decode (`codec`) with a stable cookie wire format
  and constant-time tag verification.
- A request-level façade (`service`): trusted-header path for allow-listed
  intermediaries, cookie path with transparent second-half-life refresh,
  and token injection for identities asserted upstream.
- Cluster key sharing (`cache`): rotations publish keys so any server can
  verify any server's tokens; in-memory and Redis backends.
- Durable ring snapshots (`snapshot`) so tokens survive process restarts.

Modules
- `keys`: secret key material and its cache wire form.
- `ring`: the rotating key ring.
- `codec`: token encoding/decoding and MAC verification.
- `service`: the per-request authentication façade.
- `cache`: the cluster-replicated key cache boundary.
- `snapshot`: file persistence for the ring.
- `config`: configuration surface (JSON file + `TRUSTRING_*` env).
- `server`: actix-web adapters and demo endpoints (binary uses this).
- `util`: tracing init, clock abstraction, env helpers.
"#]

pub mod cache;
pub mod codec;
pub mod config;
pub mod keys;
pub mod ring;
pub mod server;
pub mod service;
pub mod snapshot;
pub mod util;

// Re-export the primary surface for ergonomic library use.
pub use crate::cache::{slot_cache_key, MemorySharedCache, SharedKeyCache};
pub use crate::codec::{DecodeError, DecodedToken};
pub use crate::config::TokenConfig;
pub use crate::keys::{ExpiringSecretKey, SecretKeyData};
pub use crate::ring::{KeyRing, DEFAULT_RING_SIZE};
pub use crate::service::{
    CredentialSource, RequestCookie, ResponseCookie, TokenRequest, TokenResponse,
    TrustedCredentials, TrustedTokenService,
};
pub use crate::util::{Clock, ManualClock, SystemClock};

#[cfg(feature = "cache-redis")]
pub use crate::cache::RedisSharedCache;
