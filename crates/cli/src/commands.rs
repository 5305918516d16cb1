//! Subcommands. Each returns the text to print.

use std::collections::HashSet;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use seedwarden_core::{
    Catalog, Config, PrefValue, PreferenceTable, RecordId, SessionConfig, TorrentRecord,
};

/// One row of `seedwarden queue`.
#[derive(Debug, Serialize)]
struct QueueRow<'a> {
    position: usize,
    #[serde(flatten)]
    record: &'a TorrentRecord,
}

/// Managed torrents in persisted queue order. Records missing from the saved
/// order follow in id order, as the session would place them.
pub fn queue(session: &SessionConfig, json: bool) -> Result<String> {
    let path = session.catalog_path();
    let mut catalog = if path.exists() {
        Catalog::load(&path, session.torrents_dir())
            .with_context(|| format!("Failed to read catalog {:?}", path))?
    } else {
        Catalog::new(session.torrents_dir())
    };

    let order = queue_order(&mut catalog);
    let rows: Vec<QueueRow<'_>> = order
        .iter()
        .filter_map(|id| catalog.get(*id))
        .enumerate()
        .map(|(position, record)| QueueRow { position, record })
        .collect();

    if json {
        return Ok(serde_json::to_string_pretty(&rows)?);
    }
    if rows.is_empty() {
        return Ok("No managed torrents".to_string());
    }

    let lines: Vec<String> = rows
        .iter()
        .map(|row| {
            let record = row.record;
            let mut line = format!(
                "{:>3}  {:<6} {}  -> {}  [{}]",
                row.position,
                record.id,
                record.file_name(),
                record.save_directory.display(),
                record.storage_mode.as_str(),
            );
            if record.user_paused {
                line.push_str(" paused");
            }
            if record.uploaded_credit > 0 {
                line.push_str(&format!(" uploaded={}", record.uploaded_credit));
            }
            if let Some(filter) = &record.file_filter {
                line.push_str(&format!(" skipped={}/{}", filter.skipped(), filter.len()));
            }
            line
        })
        .collect();
    Ok(lines.join("\n"))
}

fn queue_order(catalog: &mut Catalog) -> Vec<RecordId> {
    let mut order = catalog.take_saved_order();
    let seen: HashSet<RecordId> = order.iter().copied().collect();
    order.extend(catalog.ids().into_iter().filter(|id| !seen.contains(id)));
    order
}

/// Every preference with its effective value. Stored values are marked.
pub fn prefs(session: &SessionConfig, json: bool) -> Result<String> {
    let table = load_prefs(session)?;
    let effective = table.effective();

    if json {
        let map: serde_json::Map<String, serde_json::Value> = effective
            .iter()
            .map(|(pref, value)| -> Result<(String, serde_json::Value)> {
                Ok((pref.name().to_string(), serde_json::to_value(value)?))
            })
            .collect::<Result<_>>()?;
        return Ok(serde_json::to_string_pretty(&map)?);
    }

    let lines: Vec<String> = effective
        .iter()
        .map(|(pref, value)| {
            let marker = if table.is_stored(*pref) { "*" } else { " " };
            format!("{} {:<24} {}", marker, pref.name(), value)
        })
        .collect();
    Ok(lines.join("\n"))
}

pub fn get_pref(session: &SessionConfig, name: &str, json: bool) -> Result<String> {
    let mut table = load_prefs(session)?;
    let value = table.get(name)?;
    if json {
        Ok(serde_json::to_string(&value)?)
    } else {
        Ok(value.to_string())
    }
}

/// Validate and store one preference. Engine-side effects happen the next
/// time a session starts.
pub fn set_pref(session: &SessionConfig, name: &str, raw: &str) -> Result<String> {
    let value: PrefValue = serde_json::from_str(raw)
        .with_context(|| format!("Invalid preference value {:?}", raw))?;

    let mut table = load_prefs(session)?;
    let pref = table.set(name, value)?;
    let path = session.prefs_path();
    table
        .save(&path)
        .with_context(|| format!("Failed to write {:?}", path))?;

    info!(preference = pref.name(), "Preference stored");
    Ok(format!("{} = {}", pref.name(), table.current(pref)))
}

pub fn check_config(config: &Config, json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string_pretty(config)?);
    }
    let session = &config.session;
    Ok(format!(
        "Configuration OK\n  base_dir:      {}\n  torrents_dir:  {}\n  blank_slate:   {}\n  cache_ttl:     {:?}\n  poll_interval: {:?}",
        session.base_dir.display(),
        session.torrents_dir().display(),
        session.blank_slate,
        session.cache_ttl(),
        session.poll_interval(),
    ))
}

/// Saved preferences, or defaults when none were saved. A corrupt file is an
/// error here; overwriting it silently would lose the user's settings.
fn load_prefs(session: &SessionConfig) -> Result<PreferenceTable> {
    let path = session.prefs_path();
    match PreferenceTable::load(&path) {
        Ok(table) => Ok(table),
        Err(e) if e.is_not_found() => Ok(PreferenceTable::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to read preferences {:?}", path)),
    }
}
