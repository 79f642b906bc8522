// pubky-bot-runtime: the service execution core.
//
// Turns declarative config templates into immutable routing snapshots,
// dispatches chat events to content-addressed service bundles, and runs
// each invocation in a fresh sandboxed interpreter process.

pub mod admin;
pub mod bundler;
pub mod dispatch;
pub mod sandbox;
pub mod snapshot;
pub mod source;

#[cfg(test)]
pub mod testutil;
