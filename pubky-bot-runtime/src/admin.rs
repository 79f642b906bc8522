//! Admin command surface: rebind and refresh a chat's config.
//!
//! Both operations force a snapshot rebuild and hand back the fresh command
//! list for the adapter to republish. Admin-only enforcement happens in the
//! adapter; this surface assumes the caller is already authorized.

use std::sync::Arc;

use pubky_bot_core::hash::canonical_json_hash;
use pubky_bot_core::store::Store;

use crate::snapshot::{CommandInfo, SnapshotBuilder};

pub struct AdminSurface {
    snapshots: Arc<SnapshotBuilder>,
    store: Arc<Store>,
}

impl AdminSurface {
    pub fn new(snapshots: Arc<SnapshotBuilder>, store: Arc<Store>) -> Self {
        Self { snapshots, store }
    }

    /// Bind a chat to a config template and rebuild its routing.
    ///
    /// A reference the source cannot deliver is an error; rebind never falls
    /// back silently, the admin must know the reference was bad.
    pub fn rebind_config(&self, chat_id: &str, config_ref: &str) -> Result<Vec<CommandInfo>, String> {
        let template = self
            .snapshots
            .fetch_template(config_ref)
            .map_err(|e| format!("cannot rebind chat {chat_id}: {e}"))?;
        let config_json = template.canonical_json();
        let config_hash = canonical_json_hash(&config_json);
        self.store
            .bind_chat(chat_id, config_ref, &config_json, &config_hash)?;
        log::info!("chat {chat_id} bound to config '{config_ref}' ({config_hash})");

        let snapshot = self.snapshots.build(chat_id, true)?;
        Ok(snapshot.command_list())
    }

    /// Re-fetch the chat's current config and rebuild its routing.
    ///
    /// Because the snapshot cache is keyed by config content, a refresh
    /// after upstream template edits produces a new snapshot even though
    /// the config id is unchanged.
    pub fn refresh_config(&self, chat_id: &str) -> Result<Vec<CommandInfo>, String> {
        if let Some(binding) = self.store.get_binding(chat_id)? {
            match self.snapshots.fetch_template(&binding.config_id) {
                Ok(template) => {
                    let config_json = template.canonical_json();
                    let config_hash = canonical_json_hash(&config_json);
                    if config_hash != binding.config_hash {
                        log::info!(
                            "config '{}' changed upstream; rebinding chat {chat_id}",
                            binding.config_id
                        );
                    }
                    self.store
                        .bind_chat(chat_id, &binding.config_id, &config_json, &config_hash)?;
                }
                Err(e) => {
                    log::warn!(
                        "refresh for chat {chat_id}: fetch of '{}' failed: {e}; keeping bound copy",
                        binding.config_id
                    );
                }
            }
        }
        let snapshot = self.snapshots.build(chat_id, true)?;
        Ok(snapshot.command_list())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{TestConfigSource, inline_service, template};
    use pubky_bot_core::types::ServiceKind;

    fn surface(templates: Vec<pubky_bot_core::config::ConfigTemplate>) -> (AdminSurface, Arc<Store>, Arc<SnapshotBuilder>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let snapshots = Arc::new(SnapshotBuilder::new(
            Arc::clone(&store),
            Box::new(TestConfigSource::new(templates)),
            "default",
        ));
        (
            AdminSurface::new(Arc::clone(&snapshots), Arc::clone(&store)),
            store,
            snapshots,
        )
    }

    #[test]
    fn rebind_binds_and_returns_the_new_command_list() {
        let games = template(
            "games",
            vec![
                inline_service("quiz", ServiceKind::MultiStep, "respond(1)"),
                inline_service("roll", ServiceKind::SingleShot, "respond(2)"),
            ],
        );
        let (surface, store, _) = surface(vec![games]);

        let commands = surface.rebind_config("c1", "games").unwrap();
        let tokens: Vec<&str> = commands.iter().map(|c| c.token.as_str()).collect();
        assert_eq!(tokens, ["quiz", "roll"]);

        let binding = store.get_binding("c1").unwrap().unwrap();
        assert_eq!(binding.config_id, "games");
    }

    #[test]
    fn rebind_to_unknown_reference_fails_loudly() {
        let (surface, store, _) = surface(vec![]);
        let err = surface.rebind_config("c1", "ghost").unwrap_err();
        assert!(err.contains("cannot rebind"), "{err}");
        assert!(store.get_binding("c1").unwrap().is_none());
    }

    #[test]
    fn refresh_on_unbound_chat_rebuilds_the_default() {
        let default = template(
            "default",
            vec![inline_service("hello", ServiceKind::SingleShot, "respond(1)")],
        );
        let (surface, _, _) = surface(vec![default]);
        let commands = surface.refresh_config("c1").unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].token, "hello");
    }

    #[test]
    fn refresh_picks_up_upstream_content_changes() {
        // Simulate an upstream edit by binding an older copy of the config,
        // while the source now serves a template with another command.
        let changed = template(
            "games",
            vec![inline_service("trivia", ServiceKind::SingleShot, "respond(1)")],
        );
        let (surface, store, _) = surface(vec![changed]);

        let old = template(
            "games",
            vec![inline_service("quiz", ServiceKind::SingleShot, "respond(0)")],
        );
        let old_json = old.canonical_json();
        let old_hash = canonical_json_hash(&old_json);
        store.bind_chat("c1", "games", &old_json, &old_hash).unwrap();

        let commands = surface.refresh_config("c1").unwrap();
        let tokens: Vec<&str> = commands.iter().map(|c| c.token.as_str()).collect();
        assert_eq!(tokens, ["trivia"]);

        // The binding hash moved with the content.
        let binding = store.get_binding("c1").unwrap().unwrap();
        assert_ne!(binding.config_hash, old_hash);
    }
}
