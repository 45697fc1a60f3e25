//! APT source list generation.
//!
//! `/etc/apt/sources.list` only carries comment boxes naming each source;
//! the entries themselves go to one `sources.list.d/<name>.list` per source,
//! with one `deb` line per suite.

use std::collections::BTreeMap;
use std::path::Path;

use crate::chroot::files::{write_file_mode, FILE_MODE};
use crate::config::PackageSource;
use crate::error::Result;

pub const SOURCES_LIST: &str = "/etc/apt/sources.list";
pub const SOURCES_LIST_D: &str = "/etc/apt/sources.list.d";

/// Text of the comment box heading `sources.list`.
const SOURCES_LIST_NOTICE: [&str; 8] = [
    "Please use /etc/apt/sources.list.d/ instead of this file",
    "and create a separate *.list configuration file for each",
    "repository, containing the type, URI, desired suites and",
    "components for that repository.",
    "",
    "See sources.list(5) for information. Only http, ftp or",
    "file URIs can be used in apt source lists. CD-ROMs are",
    "managed via the apt-cdrom utility.",
];

/// Inner width of a comment box line.
const BOX_WIDTH: usize = 58;

/// In-root path of the list file for source `name`.
pub fn list_file(name: &str) -> String {
    format!("{SOURCES_LIST_D}/{name}.list")
}

/// A comment box around `lines`.
///
/// ```text
/// # # # # # # # # # # # # # # # # # # # # # # # # # # # # # #
/// # Debian GNU/Linux                                         #
/// # # # # # # # # # # # # # # # # # # # # # # # # # # # # # #
/// ```
pub fn comment_box(lines: &[&str]) -> String {
    let rule = format!("{}#", "# ".repeat(30));
    let mut out = String::new();
    out.push_str(&rule);
    out.push('\n');
    for line in lines {
        out.push_str(&format!("# {line:<width$}#\n", width = BOX_WIDTH));
    }
    out.push_str(&rule);
    out.push('\n');
    out
}

/// `deb` (and optionally `deb-src`) lines for one source, one per suite.
///
/// The final URI replaces the build URI only when `final_uri` is requested
/// and the source defines one.
pub fn source_entries(source: &PackageSource, final_uri: bool, src: bool) -> Vec<String> {
    let uri = match (&source.final_uri, final_uri) {
        (Some(final_uri), true) => final_uri.as_str(),
        _ => source.uri.as_str(),
    };
    let components = source.components.join(" ");

    let mut entries = Vec::new();
    for suite in &source.suites {
        entries.push(format!("deb {uri} {suite} {components}"));
        if src {
            entries.push(format!("deb-src {uri} {suite} {components}"));
        }
    }
    entries
}

/// Contents of `sources.list` and of each per-source list file.
pub fn render(
    sources: &BTreeMap<String, PackageSource>,
    final_uri: bool,
    src: bool,
) -> (String, Vec<(String, String)>) {
    let mut main = comment_box(&SOURCES_LIST_NOTICE);
    let mut lists = Vec::new();

    for (name, source) in sources {
        let fname = list_file(name);
        main.push_str("\n\n");
        main.push_str(&comment_box(&[source.description.as_str(), fname.as_str()]));

        let mut content = String::new();
        for entry in source_entries(source, final_uri, src) {
            content.push_str(&entry);
            content.push('\n');
        }
        lists.push((fname, content));
    }

    (main, lists)
}

/// Write the rendered source files below `rootdir`.
pub fn write_sources(
    rootdir: &Path,
    sources: &BTreeMap<String, PackageSource>,
    final_uri: bool,
    src: bool,
) -> Result<()> {
    let (main, lists) = render(sources, final_uri, src);
    let in_root = |p: &str| rootdir.join(p.trim_start_matches('/'));

    write_file_mode(&in_root(SOURCES_LIST), &main, FILE_MODE)?;
    for (fname, content) in lists {
        write_file_mode(&in_root(&fname), &content, FILE_MODE)?;
    }
    Ok(())
}
