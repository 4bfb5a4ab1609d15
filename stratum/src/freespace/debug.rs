use std::io::Write;
use std::ops::ControlFlow;

use super::{FileSpace, FreeSpaceManager, Section};
use crate::cache::{MetadataCache, MetadataStore};
use crate::error::{MetadataError, Result};
use crate::format::Addr;

/// Print every section held by the free space manager stored at `manager_addr`.
///
/// A manager which isn't open is read through the cache for the duration of the call and dropped
/// again afterwards. Sections are never modified. If no bucket records `manager_addr` nothing is
/// printed.
pub async fn sects_debug<S: MetadataStore>(
    cache: &mut MetadataCache,
    store: &mut S,
    space: &FileSpace,
    manager_addr: Addr,
    out: &mut dyn Write,
    indent: usize,
    fwidth: usize,
) -> Result<()> {
    let Some(bucket) = space
        .locations()
        .iter()
        .find(|(_, loc)| loc.addr == manager_addr)
        .map(|(b, _)| *b)
    else {
        tracing::debug!(%manager_addr, "no free space manager at address");
        return Ok(());
    };

    if let Some(manager) = space.manager(bucket) {
        return print_sections(manager, out, indent, fwidth);
    }

    let opened = !cache.contains(manager_addr);
    if opened {
        cache
            .load::<FreeSpaceManager, S>(store, manager_addr, &())
            .await?;
    }
    let printed = cache
        .get::<FreeSpaceManager>(manager_addr)
        .and_then(|manager| print_sections(manager, out, indent, fwidth));
    if opened {
        cache.expunge(manager_addr)?;
    }
    printed
}

fn print_sections(
    manager: &FreeSpaceManager,
    out: &mut dyn Write,
    indent: usize,
    fwidth: usize,
) -> Result<()> {
    let mut failed = None;
    let _ = manager.sect_iterate(|section| match print_section(section, out, indent, fwidth) {
        Ok(()) => ControlFlow::Continue(()),
        Err(e) => {
            failed = Some(e);
            ControlFlow::Break(())
        }
    });
    match failed {
        Some(e) => Err(MetadataError::Io(e)),
        None => Ok(()),
    }
}

fn print_section(
    section: &Section,
    out: &mut dyn Write,
    indent: usize,
    fwidth: usize,
) -> std::io::Result<()> {
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Section type:", section.kind)?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Section address:", section.addr)?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Section size:", section.size)?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "End of section:", section.end())?;
    writeln!(out, "{:indent$}{:<fwidth$} {}", "", "Section state:", section.state)
}
