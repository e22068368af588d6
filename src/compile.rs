//! Dependency-driven compiler driver.
//!
//! Runs whenever the note mapping changes: discovers import edges through
//! the external [`NoteLanguage`], topologically orders notes, propagates
//! dirtiness transitively, and recompiles exactly the stale notes in
//! dependency order, reusing cached artifacts for everything else.
//!
//! The driver always returns a complete mapping of all known notes. A note
//! that fails to parse gets an empty import set plus a captured problem in
//! its [`NoteView`]; a note importing a failed note sees that failure
//! through its own environment lookup; notes that cannot be ordered
//! (cycles, unparseable) are appended in a stable fallback order so every
//! note is still compiled exactly once.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use crate::group::notes_of_files;
use crate::keyed::diff_maps;
use crate::note::{File, FileMap, Meta, Note, NoteId, NoteView};
use crate::signal::{Cell, Level, Signal, Value};

/// The external parser/typechecker/evaluator/renderer seam.
///
/// `parse_imports` extracts the literal import list from a note's text;
/// `compile` turns one note plus the compiled artifacts of its imports
/// into this language's artifact. Both must be pure: the driver decides
/// when they run based solely on input changes.
pub trait NoteLanguage: 'static {
    /// Compiled artifact per note; [`CompiledNote`](crate::CompiledNote)
    /// is the canonical choice.
    type Artifact: Value;

    /// Extract the tags imported by `text`. A failure is captured into the
    /// note's [`NoteView::problem`], never thrown past the driver.
    fn parse_imports(&self, text: &str) -> anyhow::Result<BTreeSet<NoteId>>;

    /// Compile one note against the artifacts of its (topologically
    /// earlier) imports. Imports that failed to compile earlier, or are
    /// part of a cycle, are simply absent from `env`; blame attribution is
    /// this function's responsibility.
    fn compile(&self, note: &NoteView, env: &BTreeMap<NoteId, Self::Artifact>) -> Self::Artifact;
}

/// Per-note view signals resolved into one mapping signal.
///
/// Each note gets a derived view signal joining its meta and text; the
/// signal is reused while the note's identity is unchanged, so a content
/// edit re-parses only the edited note.
pub fn note_views<L: NoteLanguage>(
    notes: &Signal<BTreeMap<NoteId, Note>>,
    lang: Rc<L>,
) -> Signal<BTreeMap<NoteId, NoteView>> {
    notes
        .map_entries(move |tag, note| {
            let lang = lang.clone();
            let parse_tag = tag.clone();
            let parsed = Signal::join(&note.meta, &note.text).map(move |(meta, text)| {
                let (imports, problem) = match lang.parse_imports(text) {
                    Ok(imports) => (imports, None),
                    Err(err) => (BTreeSet::new(), Some(err.to_string())),
                };
                NoteView {
                    tag: parse_tag.clone(),
                    meta: meta.clone(),
                    text: text.clone(),
                    imports,
                    problem,
                }
            });
            // Containment boundary: a failing meta or text signal becomes
            // this note's problem instead of failing the whole mapping.
            let tag = tag.clone();
            parsed.lift_to_try().map(move |view| match view {
                Ok(view) => view.clone(),
                Err(err) => NoteView {
                    tag: tag.clone(),
                    meta: Meta::default(),
                    text: String::new(),
                    imports: BTreeSet::new(),
                    problem: Some(err.to_string()),
                },
            })
        })
        .label("note_views")
        .join_entries()
        .label("parsed_notes")
}

/// Topologically sort notes by import edges via repeated fixed-point
/// passes: append any note whose imports are already ordered (imports of
/// unknown tags do not block), repeat until nothing moves. Leftovers —
/// cyclic or self-importing notes — are appended in key order, a stable
/// fallback so every note is still compiled exactly once.
pub fn sort_notes(imports: &BTreeMap<NoteId, BTreeSet<NoteId>>) -> Vec<NoteId> {
    let mut order = Vec::with_capacity(imports.len());
    let mut remaining: BTreeSet<&NoteId> = imports.keys().collect();
    let mut again = true;
    while again {
        again = false;
        for (tag, deps) in imports {
            if !remaining.contains(tag) {
                continue;
            }
            if deps.iter().all(|dep| !remaining.contains(dep)) {
                order.push(tag.clone());
                remaining.remove(tag);
                again = true;
            }
        }
    }
    for tag in remaining {
        tracing::debug!(%tag, "unorderable note (cycle or self-import), using fallback order");
        order.push(tag.clone());
    }
    order
}

/// Walking the order, mark dirty any cached note that imports an
/// already-dirty note, evicting it from the cache. Walking in topological
/// order closes transitive invalidation regardless of edit order.
fn dirty_transitively<C>(
    order: &[NoteId],
    imports: &BTreeMap<NoteId, BTreeSet<NoteId>>,
    compiled: &mut BTreeMap<NoteId, C>,
) {
    let mut dirty: BTreeSet<&NoteId> = BTreeSet::new();
    for tag in order {
        if !compiled.contains_key(tag) {
            dirty.insert(tag);
            continue;
        }
        let imported_dirty = imports
            .get(tag)
            .is_some_and(|deps| deps.iter().any(|dep| dirty.contains(dep)));
        if imported_dirty {
            tracing::debug!(%tag, "dirty via import");
            dirty.insert(tag);
            compiled.remove(tag);
        }
    }
}

/// Walking the order, compile each cache-miss note against the artifacts
/// of its imports. Cache hits are reused untouched.
fn compile_dirty<L: NoteLanguage>(
    order: &[NoteId],
    views: &BTreeMap<NoteId, NoteView>,
    compiled: &mut BTreeMap<NoteId, L::Artifact>,
    lang: &L,
) {
    for tag in order {
        if compiled.contains_key(tag) {
            continue;
        }
        let Some(view) = views.get(tag) else {
            continue;
        };
        let mut env = BTreeMap::new();
        for import in &view.imports {
            if let Some(artifact) = compiled.get(import) {
                env.insert(import.clone(), artifact.clone());
            }
        }
        tracing::debug!(%tag, imports = view.imports.len(), "compiling note");
        let artifact = lang.compile(view, &env);
        compiled.insert(tag.clone(), artifact);
    }
}

/// The driver: a signal of compiled artifacts over a signal of note views.
///
/// On each pass it diffs the view mapping against the previous one, evicts
/// the cache entry of any note whose view (text, metadata, parse result,
/// import set) or existence changed, then sorts, dirties transitively, and
/// compiles exactly the stale notes in dependency order.
pub fn compile_notes<L: NoteLanguage>(
    views: &Signal<BTreeMap<NoteId, NoteView>>,
    lang: Rc<L>,
) -> Signal<BTreeMap<NoteId, L::Artifact>> {
    views
        .map_with_prev(
            BTreeMap::new(),
            BTreeMap::new(),
            move |views, prev_views, prev_compiled| {
                let mut compiled = prev_compiled.clone();
                let delta = diff_maps(prev_views, views);
                for tag in delta.removed.keys().chain(delta.changed.keys()) {
                    tracing::debug!(%tag, "evicting compiled note");
                    compiled.remove(tag);
                }

                let imports: BTreeMap<NoteId, BTreeSet<NoteId>> = views
                    .iter()
                    .map(|(tag, view)| (tag.clone(), view.imports.clone()))
                    .collect();
                let order = sort_notes(&imports);
                dirty_transitively(&order, &imports, &mut compiled);
                compile_dirty(&order, views, &mut compiled, &*lang);
                compiled
            },
        )
        .label("compiled_notes")
}

/// Engine façade wiring the full pipeline: file mapping → note grouping →
/// import discovery → topological order → dirty propagation → selective
/// recompilation.
///
/// The workspace owns the file-watcher boundary: `update_file` /
/// `remove_file` are the synchronous entry points the watcher calls, and
/// the optional on-change callback (the host's "schedule another pass"
/// hook) is forwarded to every cell the workspace creates. `reconcile`
/// issues strictly increasing levels on the host's behalf.
pub struct Workspace<L: NoteLanguage> {
    files: Cell<FileMap>,
    file_cells: RefCell<BTreeMap<String, Cell<File>>>,
    notes: Signal<BTreeMap<NoteId, Note>>,
    compiled: Signal<BTreeMap<NoteId, L::Artifact>>,
    on_change: Option<Rc<dyn Fn()>>,
    level: Level,
}

impl<L: NoteLanguage> Workspace<L> {
    /// New workspace compiling with `lang`.
    pub fn new(lang: L) -> Workspace<L> {
        Workspace::build(lang, None)
    }

    /// New workspace invoking `on_change` after every effective external
    /// mutation.
    pub fn with_on_change(lang: L, on_change: impl Fn() + 'static) -> Workspace<L> {
        Workspace::build(lang, Some(Rc::new(on_change)))
    }

    fn build(lang: L, on_change: Option<Rc<dyn Fn()>>) -> Workspace<L> {
        let files = match &on_change {
            Some(on_change) => {
                let on_change = on_change.clone();
                Cell::with_on_change(Ok(FileMap::new()), move || (*on_change)())
            }
            None => Cell::ok(FileMap::new()),
        };
        let lang = Rc::new(lang);
        let notes = notes_of_files(&files.signal());
        let views = note_views(&notes, lang.clone());
        let compiled = compile_notes(&views, lang);
        Workspace {
            files,
            file_cells: RefCell::new(BTreeMap::new()),
            notes,
            compiled,
            on_change,
            level: 0,
        }
    }

    /// The changing path→file mapping, as the watcher sees it.
    pub fn files(&self) -> &Cell<FileMap> {
        &self.files
    }

    /// The changing tag→note mapping.
    pub fn notes(&self) -> &Signal<BTreeMap<NoteId, Note>> {
        &self.notes
    }

    /// The compiled-notes signal read by UI and export consumers.
    pub fn compiled(&self) -> &Signal<BTreeMap<NoteId, L::Artifact>> {
        &self.compiled
    }

    /// Create or update one file. An update with equal content and mtime
    /// is a no-op.
    pub fn update_file(&self, path: &str, content: impl Into<Vec<u8>>, mtime: u64) {
        let file = File::new(path, content, mtime);
        let existing = self.file_cells.borrow().get(path).cloned();
        match existing {
            Some(cell) => cell.set_ok(file),
            None => {
                let cell = match &self.on_change {
                    Some(on_change) => {
                        let on_change = on_change.clone();
                        Cell::with_on_change(Ok(file), move || (*on_change)())
                    }
                    None => Cell::ok(file),
                };
                self.file_cells
                    .borrow_mut()
                    .insert(path.to_string(), cell.clone());
                let signal = cell.signal();
                self.files.update(|files| {
                    let mut files = files.clone();
                    files.insert(path.to_string(), signal.clone());
                    files
                });
            }
        }
    }

    /// Remove one file. Unknown paths are a no-op.
    pub fn remove_file(&self, path: &str) {
        if self.file_cells.borrow_mut().remove(path).is_some() {
            self.files.update(|files| {
                let mut files = files.clone();
                files.remove(path);
                files
            });
        }
    }

    /// Run one reconciliation pass at the next level and return it.
    pub fn reconcile(&mut self) -> Level {
        self.level += 1;
        self.compiled.reconcile(self.level);
        self.level
    }
}
