//! Client-side cache for the signed-in user's profile.
//!
//! `ProfileCache` deduplicates concurrent fetches, serves fresh entries for
//! 5 minutes, retries a failed fetch once, and keeps the last good profile
//! visible while revalidating or after a failure.

pub mod profile;

pub use profile::{
    CachedData, FetchError, ProfileCache, ProfileCacheOptions, ProfileSnapshot, PROFILE_CACHE_KEY,
};
