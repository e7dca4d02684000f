//! Policy routing table registration, selection rule and flush

use crate::error::{NetError, Result};
use futures::TryStreamExt;
use rtnetlink::packet_route::rule::{RuleAction, RuleAttribute};
use rtnetlink::{Handle, IpVersion};
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// System registry mapping numeric route table ids to names.
pub const RT_TABLES_FILE: &str = "/etc/iproute2/rt_tables";

/// Ensures the named custom routing table and its selection rule exist, and
/// can flush all routes from the table.
pub struct PolicyRouteTableManager {
    handle: Handle,
    tables_file: PathBuf,
}

impl PolicyRouteTableManager {
    pub fn new(handle: Handle) -> Self {
        Self::with_tables_file(handle, RT_TABLES_FILE)
    }

    pub fn with_tables_file(handle: Handle, tables_file: impl AsRef<Path>) -> Self {
        Self {
            handle,
            tables_file: tables_file.as_ref().to_path_buf(),
        }
    }

    /// Appends `<id> <name>` to the route-table name registry unless a line
    /// exactly matching it already exists. Comparison is exact-string, not
    /// semantic: the same id registered under a different name is treated
    /// as not present.
    pub fn ensure_route_table_registered(&self, id: u32, name: &str) -> Result<()> {
        let appended = Self::register_in_file(&self.tables_file, id, name)?;
        if appended {
            debug!(
                "Registered route table {} {} in {}",
                id,
                name,
                self.tables_file.display()
            );
        }
        Ok(())
    }

    fn register_in_file(path: &Path, id: u32, name: &str) -> Result<bool> {
        let mut file = OpenOptions::new().read(true).append(true).open(path)?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let entry = format!("{} {}", id, name);
        if contents.lines().any(|line| line == entry) {
            return Ok(false);
        }

        writeln!(file, "{}", entry)?;
        Ok(true)
    }

    /// Installs an unconditional IPv4 rule directing lookups to `table_id`
    /// unless some rule already targets it.
    pub async fn ensure_selection_rule(&self, table_id: u32) -> Result<()> {
        let mut rules = self.handle.rule().get(IpVersion::V4).execute();
        while let Some(rule) = rules.try_next().await? {
            let target = rule
                .attributes
                .iter()
                .find_map(|attr| match attr {
                    RuleAttribute::Table(table) => Some(*table),
                    _ => None,
                })
                .unwrap_or(u32::from(rule.header.table));
            if target == table_id {
                return Ok(());
            }
        }

        self.handle
            .rule()
            .add()
            .v4()
            .table_id(table_id)
            .action(RuleAction::ToTable)
            .execute()
            .await?;
        debug!("Installed selection rule for route table {}", table_id);
        Ok(())
    }

    /// Flushes all routes from the named table. On failure the command's
    /// combined output is carried in the error for diagnostics.
    pub async fn flush_table(&self, name: &str) -> Result<()> {
        let output = Command::new("ip")
            .args(["route", "flush", "table", name])
            .output()
            .await?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(NetError::FlushFailed {
                table: name.to_string(),
                output: combined,
            });
        }
        Ok(())
    }
}
