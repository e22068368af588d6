//! Note grouping: projecting the changing path→file mapping into a
//! changing tag→note mapping.
//!
//! Files sharing a tag form one note; a directory's `index.*` files form
//! that directory's index note. A directory's `index.meta` additionally
//! provides inherited, overridable defaults (`dir_meta`) to the notes
//! below it, so the grouping injects the nearest ancestor `index.meta`
//! into every non-index group.

use std::collections::BTreeMap;

use crate::note::{
    dir_of_path, is_index_meta, stem_of_path, tag_of_path, ContentType, File, FileMap, Meta, Note,
    NoteId,
};
use crate::signal::Signal;

/// Member files of one note, keyed by path. Values compare by signal
/// identity, so a group is unchanged exactly while its membership is.
pub type NoteGroup = BTreeMap<String, Signal<File>>;

/// Ancestor directories of `dir`, innermost first, ending with the root
/// (the empty string).
fn ancestors(dir: &str) -> impl Iterator<Item = &str> {
    let mut next = Some(dir);
    std::iter::from_fn(move || {
        let dir = next?;
        next = match dir.rfind('/') {
            Some(i) => Some(&dir[..i]),
            None if !dir.is_empty() => Some(""),
            None => None,
        };
        Some(dir)
    })
}

/// Group a file mapping by tag and inject each non-index group's nearest
/// ancestor `index.meta`.
pub fn group_files_by_tag(files: &FileMap) -> BTreeMap<NoteId, NoteGroup> {
    let mut index_metas: BTreeMap<&str, (&String, &Signal<File>)> = BTreeMap::new();
    for (path, signal) in files {
        if is_index_meta(path) {
            index_metas.insert(dir_of_path(path), (path, signal));
        }
    }

    let mut groups: BTreeMap<NoteId, NoteGroup> = BTreeMap::new();
    for (path, signal) in files {
        groups
            .entry(tag_of_path(path))
            .or_default()
            .insert(path.clone(), signal.clone());
    }

    for (tag, group) in groups.iter_mut() {
        if is_index_group(tag, group) {
            continue;
        }
        let found = ancestors(dir_of_path(tag))
            .find_map(|dir| index_metas.get(dir))
            .copied();
        if let Some((path, signal)) = found {
            group.entry(path.clone()).or_insert_with(|| signal.clone());
        }
    }
    groups
}

fn index_stem(tag: &str) -> String {
    if tag.is_empty() {
        "index".to_string()
    } else {
        format!("{tag}/index")
    }
}

fn is_index_group(tag: &str, group: &NoteGroup) -> bool {
    let stem = index_stem(tag);
    group.keys().any(|path| stem_of_path(path) == stem)
}

/// Build a note from one group of member files.
///
/// The note's meta signal merges its own metadata file over the inherited
/// directory defaults; an index note takes its own `index.meta` directly
/// (its `dir_meta` applies to siblings, not itself). A missing title
/// defaults to the last segment of the tag.
pub fn note_of_group(tag: &NoteId, group: &NoteGroup) -> Note {
    let is_index = is_index_group(tag, group);

    let own_meta = group.iter().find_map(|(path, signal)| {
        let own = if is_index {
            is_index_meta(path) && tag_of_path(path) == *tag
        } else {
            !is_index_meta(path) && ContentType::of_path(path) == Some(ContentType::Meta)
        };
        own.then(|| signal.map(Meta::parse))
    });
    let inherited_meta = (!is_index)
        .then(|| {
            group.iter().find_map(|(path, signal)| {
                is_index_meta(path).then(|| signal.map(|file| Meta::parse(file).inherited()))
            })
        })
        .flatten();

    let merged = match (own_meta, inherited_meta) {
        (Some(own), Some(inherited)) => {
            Signal::join(&own, &inherited).map(|(own, inherited)| own.clone().or(inherited.clone()))
        }
        (Some(own), None) => own,
        (None, Some(inherited)) => inherited,
        (None, None) => Signal::ok(Meta::default()),
    };
    let default_title = tag.rsplit('/').next().unwrap_or(tag).to_string();
    let meta = merged.map(move |meta| {
        let mut meta = meta.clone();
        meta.title = meta.title.or_else(|| Some(default_title.clone()));
        meta
    });

    let mut files: BTreeMap<ContentType, Signal<File>> = BTreeMap::new();
    for (path, signal) in group {
        if !is_index && is_index_meta(path) {
            continue;
        }
        let content_type = ContentType::of_path(path).unwrap_or(ContentType::Document);
        files.insert(content_type, signal.clone());
    }

    let text = [ContentType::Document, ContentType::Table, ContentType::Json]
        .iter()
        .find_map(|content_type| files.get(content_type))
        .map(|signal| signal.map(File::text))
        .unwrap_or_else(|| Signal::ok(String::new()));

    Note {
        tag: tag.clone(),
        is_index,
        meta,
        files,
        text,
    }
}

/// The grouping pipeline: path→file mapping in, tag→note mapping out.
///
/// Grouping is recomputed whenever the file mapping's membership changes,
/// but notes whose groups are untouched keep their identity, so their
/// derived signals (and everything downstream) are reused.
pub fn notes_of_files(files: &Signal<FileMap>) -> Signal<BTreeMap<NoteId, Note>> {
    files
        .map(group_files_by_tag)
        .label("group_files")
        .map_entries(note_of_group)
        .label("notes_of_files")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Cell;

    fn file_map(entries: &[(&str, &str)]) -> (FileMap, BTreeMap<String, Cell<File>>) {
        let mut files = FileMap::new();
        let mut cells = BTreeMap::new();
        for (path, content) in entries {
            let cell = Cell::ok(File::new(*path, *content, 1));
            files.insert(path.to_string(), cell.signal());
            cells.insert(path.to_string(), cell);
        }
        (files, cells)
    }

    #[test]
    fn groups_by_tag() {
        let (files, _cells) = file_map(&[
            ("a.md", "A"),
            ("a.meta", "{}"),
            ("b.md", "B"),
        ]);
        let groups = group_files_by_tag(&files);
        assert_eq!(
            groups.keys().cloned().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(groups["a"].len(), 2);
    }

    #[test]
    fn index_meta_is_injected_into_sibling_groups() {
        let (files, _cells) = file_map(&[
            ("notes/index.meta", "{}"),
            ("notes/todo.md", "todo"),
        ]);
        let groups = group_files_by_tag(&files);
        assert!(groups["notes/todo"].contains_key("notes/index.meta"));
        // ...but the index group does not inherit from itself.
        assert_eq!(groups["notes"].len(), 1);
    }

    #[test]
    fn nearest_ancestor_index_meta_wins() {
        let (files, _cells) = file_map(&[
            ("index.meta", "{}"),
            ("notes/index.meta", "{}"),
            ("notes/deep/todo.md", "todo"),
        ]);
        let groups = group_files_by_tag(&files);
        let group = &groups["notes/deep/todo"];
        assert!(group.contains_key("notes/index.meta"));
        assert!(!group.contains_key("index.meta"));
    }

    #[test]
    fn meta_inheritance_and_override() {
        let (files, _cells) = file_map(&[
            (
                "notes/index.meta",
                r#"{ "dirMeta": { "layout": "doc", "publish": true } }"#,
            ),
            ("notes/todo.md", "todo"),
            ("notes/todo.meta", r#"{ "layout": "list" }"#),
        ]);
        let groups = group_files_by_tag(&files);
        let note = note_of_group(&"notes/todo".to_string(), &groups["notes/todo"]);
        note.meta.reconcile(1);
        let meta = note.meta.get();
        assert_eq!(meta.layout.as_deref(), Some("list"));
        assert_eq!(meta.publish, Some(true));
        assert_eq!(meta.title.as_deref(), Some("todo"));
    }

    #[test]
    fn index_note_ignores_its_own_dir_meta() {
        let (files, _cells) = file_map(&[
            (
                "notes/index.meta",
                r#"{ "title": "Notes", "dirMeta": { "layout": "doc" } }"#,
            ),
            ("notes/index.md", "hello"),
        ]);
        let groups = group_files_by_tag(&files);
        let note = note_of_group(&"notes".to_string(), &groups["notes"]);
        assert!(note.is_index);
        note.meta.reconcile(1);
        let meta = note.meta.get();
        assert_eq!(meta.title.as_deref(), Some("Notes"));
        assert_eq!(meta.layout, None);
    }

    #[test]
    fn text_prefers_document_content() {
        let (files, _cells) = file_map(&[
            ("a.md", "document"),
            ("a.json", "{}"),
        ]);
        let groups = group_files_by_tag(&files);
        let note = note_of_group(&"a".to_string(), &groups["a"]);
        note.text.reconcile(1);
        assert_eq!(note.text.get(), "document");
    }

    #[test]
    fn notes_preserve_identity_across_content_edits() {
        let (files, cells) = file_map(&[("a.md", "one"), ("b.md", "two")]);
        let files_cell = Cell::ok(files);
        let notes = notes_of_files(&files_cell.signal());
        notes.reconcile(1);
        let before = notes.get();

        cells["a.md"].set_ok(File::new("a.md", "edited", 2));
        notes.reconcile(2);
        let after = notes.get();
        // Same note identity: derived signals are reused.
        assert_eq!(before["a"], after["a"]);
        after["a"].text.reconcile(3);
        assert_eq!(after["a"].text.get(), "edited");
    }

    #[test]
    fn removing_the_last_member_drops_the_tag() {
        let (files, _cells) = file_map(&[("a.md", "one"), ("b.md", "two")]);
        let files_cell = Cell::ok(files.clone());
        let notes = notes_of_files(&files_cell.signal());
        notes.reconcile(1);
        assert!(notes.get().contains_key("a"));

        let mut smaller = files;
        smaller.remove("a.md");
        files_cell.set_ok(smaller);
        notes.reconcile(2);
        let remaining = notes.get();
        assert!(!remaining.contains_key("a"));
        assert!(remaining.contains_key("b"));
    }

    #[test]
    fn membership_change_rebuilds_the_note() {
        let (files, _cells) = file_map(&[("a.md", "one")]);
        let files_cell = Cell::ok(files.clone());
        let notes = notes_of_files(&files_cell.signal());
        notes.reconcile(1);
        let before = notes.get();

        let meta_cell = Cell::ok(File::new("a.meta", r#"{ "publish": true }"#, 2));
        let mut larger = files;
        larger.insert("a.meta".to_string(), meta_cell.signal());
        files_cell.set_ok(larger);
        notes.reconcile(2);
        let after = notes.get();
        assert_ne!(before["a"], after["a"]);
        after["a"].meta.reconcile(3);
        assert_eq!(after["a"].meta.get().publish, Some(true));
    }
}
