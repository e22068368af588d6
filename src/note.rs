//! Data model: files, notes, metadata, and compiled artifacts.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::signal::Signal;

/// Identity of a note: its tag, the path shared by its member files minus
/// extension (directory path for index notes).
pub type NoteId = String;

/// The changing path→file mapping consumed from the file watcher. Each
/// file signal is typically a [`Cell`](crate::Cell) the watcher updates in
/// place; the mapping itself changes when files appear or disappear.
pub type FileMap = BTreeMap<String, Signal<File>>;

/// One source file, owned and mutated only by the external file watcher.
#[derive(Debug, Clone, PartialEq)]
pub struct File {
    /// Workspace-relative path, `/`-separated.
    pub path: String,
    /// Raw content bytes.
    pub content: Arc<Vec<u8>>,
    /// Modification time reported by the watcher.
    pub mtime: u64,
}

impl File {
    /// New file from raw bytes.
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>, mtime: u64) -> File {
        File {
            path: path.into(),
            content: Arc::new(content.into()),
            mtime,
        }
    }

    /// Content decoded as text, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

/// Classification of a note's member files by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContentType {
    /// Metadata record (`.meta`).
    Meta,
    /// Primary document text (`.md`, `.mdx`, and unknown extensions).
    Document,
    /// Structured data (`.json`).
    Json,
    /// Tabular data (`.table`).
    Table,
    /// Image (`.jpg`, `.jpeg`).
    Image,
}

impl ContentType {
    /// Classify a path by its extension. Unknown extensions return `None`;
    /// callers default those to [`ContentType::Document`].
    pub fn of_path(path: &str) -> Option<ContentType> {
        let ext = ext_of(path)?;
        match ext.to_ascii_lowercase().as_str() {
            "meta" => Some(ContentType::Meta),
            "md" | "mdx" => Some(ContentType::Document),
            "json" => Some(ContentType::Json),
            "table" => Some(ContentType::Table),
            "jpg" | "jpeg" => Some(ContentType::Image),
            _ => None,
        }
    }
}

/// Note metadata, merged from zero or more `.meta` files.
///
/// Each field is optional so that note-level metadata can override
/// inherited directory-level metadata field by field.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Meta {
    /// Display title.
    pub title: Option<String>,
    /// Classification tags.
    pub tags: Option<Vec<String>>,
    /// Layout used when rendering.
    pub layout: Option<String>,
    /// Whether the note is published by the export walker.
    pub publish: Option<bool>,
    /// Declared type of the note's data payload, in the external
    /// expression language's syntax.
    pub data_type: Option<String>,
    /// Defaults inherited by sibling notes when this record comes from a
    /// directory's `index.meta`.
    pub dir_meta: Option<Box<Meta>>,
}

impl Meta {
    /// Parse a metadata file. Unparseable metadata is logged and treated
    /// as empty rather than failing the note.
    pub fn parse(file: &File) -> Meta {
        match serde_json::from_slice(&file.content) {
            Ok(meta) => meta,
            Err(err) => {
                tracing::warn!(path = %file.path, %err, "unparseable metadata file");
                Meta::default()
            }
        }
    }

    /// Field-wise merge, `self` taking precedence over `fallback`.
    pub fn or(self, fallback: Meta) -> Meta {
        Meta {
            title: self.title.or(fallback.title),
            tags: self.tags.or(fallback.tags),
            layout: self.layout.or(fallback.layout),
            publish: self.publish.or(fallback.publish),
            data_type: self.data_type.or(fallback.data_type),
            dir_meta: self.dir_meta.or(fallback.dir_meta),
        }
    }

    /// The defaults this record provides to sibling notes.
    pub fn inherited(&self) -> Meta {
        self.dir_meta.as_deref().cloned().unwrap_or_default()
    }
}

/// Logical document: one or more files sharing a tag.
///
/// Equality is structural over the tag and flags and identity over the
/// signal-valued fields, so a note compares equal exactly while its member
/// file set is unchanged — the property the keyed adapter relies on to
/// preserve note identity across content edits.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    /// The note's tag.
    pub tag: NoteId,
    /// True if this note is a directory's index note.
    pub is_index: bool,
    /// Merged metadata: own metadata over inherited directory defaults.
    pub meta: Signal<Meta>,
    /// Member files by content type.
    pub files: BTreeMap<ContentType, Signal<File>>,
    /// Decoded text of the primary content file; empty for notes with no
    /// textual content.
    pub text: Signal<String>,
}

/// Per-note snapshot fed to the external compile function: the note's
/// current metadata and text plus its discovered import edges.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteView {
    /// The note's tag.
    pub tag: NoteId,
    /// Resolved metadata.
    pub meta: Meta,
    /// Primary text.
    pub text: String,
    /// Tags of the notes this note imports. Empty when import discovery
    /// failed; see `problem`.
    pub imports: BTreeSet<NoteId>,
    /// Import-discovery failure, captured rather than thrown so the
    /// compiler can attach it to this note's result.
    pub problem: Option<String>,
}

/// Opaque handle to rendered output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered(Arc<str>);

impl Rendered {
    /// Wrap rendered output.
    pub fn new(rendered: impl Into<Arc<str>>) -> Rendered {
        Rendered(rendered.into())
    }

    /// The rendered output.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Rendered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical compiled artifact produced by the external compile function.
///
/// Implementations of [`NoteLanguage`](crate::NoteLanguage) may substitute
/// their own artifact type; this is the shape read by UI and export
/// consumers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompiledNote {
    /// Exported module signature: name → type, as reported by the
    /// external typechecker.
    pub export_type: BTreeMap<String, String>,
    /// Exported values: name → evaluated value.
    pub export_value: BTreeMap<String, serde_json::Value>,
    /// Rendered output handle.
    pub rendered: Option<Rendered>,
    /// True if compilation recorded any problem for this note.
    pub problems: bool,
}

fn split_dir_base(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

fn ext_of(path: &str) -> Option<&str> {
    let (_, base) = split_dir_base(path);
    base.rfind('.').map(|i| &base[i + 1..])
}

fn strip_ext(path: &str) -> &str {
    let (_, base) = split_dir_base(path);
    match base.rfind('.') {
        Some(i) => &path[..path.len() - (base.len() - i)],
        None => path,
    }
}

/// Path minus its extension.
pub fn stem_of_path(path: &str) -> &str {
    strip_ext(path)
}

/// The tag a path belongs to: the path minus extension, except that files
/// whose stem is `index` belong to their directory's tag.
pub fn tag_of_path(path: &str) -> NoteId {
    let stem = strip_ext(path);
    let (dir, base) = split_dir_base(stem);
    if base == "index" {
        dir.to_string()
    } else {
        stem.to_string()
    }
}

/// Directory of a path, empty for top-level paths.
pub fn dir_of_path(path: &str) -> &str {
    split_dir_base(path).0
}

/// True for a directory's `index.meta` file.
pub fn is_index_meta(path: &str) -> bool {
    split_dir_base(path).1 == "index.meta"
}
