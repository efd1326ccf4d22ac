//! Lazily compiled graphics pipelines, cached in a five-tier tree.
//!
//! Pass -> subpass -> shader program -> vertex layout -> input assembly.
//! The tier-5 leaf holds the compiled pipeline. Every node carries an
//! `initial` flag; a leaf is (re)compiled when any node on its path is
//! initial, after which the whole path is cleared. Nodes are stored in
//! append-only per-tier tables and referenced by index, so a published
//! child never moves or disappears.
//!
//! The database is shared by every recording thread. A mutex guards the
//! tree and the cursor; it is never held across a driver call. Each node
//! counts how often it was invalidated, and a compile only clears its path
//! if none of those counts moved while the driver was busy.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use cgfx_core::DriverHandle;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::driver::Driver;
use crate::error::DriverResult;
use crate::pipeline::{
    GraphicsPipelineDesc, InputAssemblyKey, PassId, PassInfo, ShaderProgramId, ShaderProgramInfo,
    VertexLayoutId, VertexLayoutInfo,
};

struct Node<F, K> {
    initial: bool,
    generation: u32,
    fragment: F,
    children: HashMap<K, u32>,
}

impl<F, K> Node<F, K> {
    fn new(fragment: F) -> Self {
        Self {
            initial: true,
            generation: 0,
            fragment,
            children: HashMap::new(),
        }
    }

    fn invalidate(&mut self) {
        self.initial = true;
        self.generation = self.generation.wrapping_add(1);
    }
}

struct Leaf {
    key: InputAssemblyKey,
    initial: bool,
    generation: u32,
    pipeline: Option<DriverHandle>,
}

impl Leaf {
    fn invalidate(&mut self) {
        self.initial = true;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Subpass index and its live color attachment count.
#[derive(Clone, Copy)]
struct SubpassFragment {
    index: u32,
    attachments: u32,
}

#[derive(Default)]
struct Tree {
    passes: HashMap<PassId, u32>,
    tier1: Vec<Node<Arc<PassInfo>, u32>>,
    tier2: Vec<Node<SubpassFragment, ShaderProgramId>>,
    tier3: Vec<Node<Arc<ShaderProgramInfo>, VertexLayoutId>>,
    tier4: Vec<Node<Arc<VertexLayoutInfo>, InputAssemblyKey>>,
    tier5: Vec<Leaf>,
}

/// Current position in the tree, one node index per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Cursor {
    pass: Option<u32>,
    subpass: Option<u32>,
    program: Option<u32>,
    vertex_layout: Option<u32>,
    input_assembly: Option<u32>,
}

impl Cursor {
    #[track_caller]
    fn path(&self) -> [u32; 5] {
        match (
            self.pass,
            self.subpass,
            self.program,
            self.vertex_layout,
            self.input_assembly,
        ) {
            (Some(t1), Some(t2), Some(t3), Some(t4), Some(t5)) => [t1, t2, t3, t4, t5],
            _ => panic!("pipeline database cursor is incomplete: {:?}", self),
        }
    }
}

#[derive(Default)]
struct State {
    tree: Tree,
    cursor: Cursor,
    retired: Vec<DriverHandle>,
    stats: PipelineDatabaseStats,
    warmed_up: bool,
}

/// Counters describing the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineDatabaseStats {
    pub compiled: u64,
    pub cache_hits: u64,
    pub passes: usize,
    pub subpasses: usize,
    pub programs: usize,
    pub vertex_layouts: usize,
    pub pipelines: usize,
}

/// All five keys of one pipeline, for resolving in a single step.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub pass: Arc<PassInfo>,
    pub subpass: u32,
    pub program: Arc<ShaderProgramInfo>,
    pub vertex_layout: Arc<VertexLayoutInfo>,
    pub input_assembly: InputAssemblyKey,
}

pub struct PipelineDatabase {
    driver: Arc<dyn Driver>,
    warn_on_compile: bool,
    state: Mutex<State>,
}

/// Find or create the child of `parent` under `key`. A fragment that is no
/// longer the same object as the stored one replaces it and invalidates the
/// subtree.
fn descend<F, K, CF, CK>(
    parent: &mut Node<F, K>,
    key: K,
    children: &mut Vec<Node<CF, CK>>,
    fragment: CF,
    same: impl Fn(&CF, &CF) -> bool,
) -> (u32, bool)
where
    K: Eq + Hash,
{
    if let Some(&index) = parent.children.get(&key) {
        let child = &mut children[index as usize];
        if same(&child.fragment, &fragment) {
            return (index, false);
        }
        child.fragment = fragment;
        child.invalidate();
        return (index, true);
    }
    let index = children.len() as u32;
    children.push(Node::new(fragment));
    parent.children.insert(key, index);
    (index, false)
}

impl Tree {
    fn invalidate_tier1(&mut self, index: u32) {
        let node = &mut self.tier1[index as usize];
        node.invalidate();
        let children: Vec<u32> = node.children.values().copied().collect();
        for child in children {
            self.invalidate_tier2(child);
        }
    }

    fn invalidate_tier2(&mut self, index: u32) {
        let node = &mut self.tier2[index as usize];
        node.invalidate();
        let children: Vec<u32> = node.children.values().copied().collect();
        for child in children {
            self.invalidate_tier3(child);
        }
    }

    fn invalidate_tier3(&mut self, index: u32) {
        let node = &mut self.tier3[index as usize];
        node.invalidate();
        let children: Vec<u32> = node.children.values().copied().collect();
        for child in children {
            self.invalidate_tier4(child);
        }
    }

    fn invalidate_tier4(&mut self, index: u32) {
        let node = &mut self.tier4[index as usize];
        node.invalidate();
        for &leaf in node.children.values() {
            self.tier5[leaf as usize].invalidate();
        }
    }

    fn path_is_initial(&self, [t1, t2, t3, t4, t5]: [u32; 5]) -> bool {
        self.tier1[t1 as usize].initial
            || self.tier2[t2 as usize].initial
            || self.tier3[t3 as usize].initial
            || self.tier4[t4 as usize].initial
            || self.tier5[t5 as usize].initial
            || self.tier5[t5 as usize].pipeline.is_none()
    }

    fn generations(&self, [t1, t2, t3, t4, t5]: [u32; 5]) -> [u32; 5] {
        [
            self.tier1[t1 as usize].generation,
            self.tier2[t2 as usize].generation,
            self.tier3[t3 as usize].generation,
            self.tier4[t4 as usize].generation,
            self.tier5[t5 as usize].generation,
        ]
    }

    fn clear_path(&mut self, [t1, t2, t3, t4, t5]: [u32; 5]) {
        self.tier1[t1 as usize].initial = false;
        self.tier2[t2 as usize].initial = false;
        self.tier3[t3 as usize].initial = false;
        self.tier4[t4 as usize].initial = false;
        self.tier5[t5 as usize].initial = false;
    }

    fn describe(&self, [t1, t2, t3, t4, t5]: [u32; 5]) -> GraphicsPipelineDesc {
        let subpass = self.tier2[t2 as usize].fragment;
        GraphicsPipelineDesc {
            pass: self.tier1[t1 as usize].fragment.clone(),
            subpass: subpass.index,
            color_attachment_count: subpass.attachments,
            program: self.tier3[t3 as usize].fragment.clone(),
            vertex_layout: self.tier4[t4 as usize].fragment.clone(),
            input_assembly: self.tier5[t5 as usize].key,
        }
    }
}

impl State {
    fn set_pass(&mut self, pass: Arc<PassInfo>) {
        let tree = &mut self.tree;
        let existing = tree.passes.get(&pass.id).copied();
        let index = match existing {
            Some(index) => {
                if !Arc::ptr_eq(&tree.tier1[index as usize].fragment, &pass) {
                    tree.tier1[index as usize].fragment = pass;
                    tree.invalidate_tier1(index);
                }
                index
            }
            None => {
                let index = tree.tier1.len() as u32;
                tree.passes.insert(pass.id, index);
                tree.tier1.push(Node::new(pass));
                index
            }
        };
        self.cursor = Cursor {
            pass: Some(index),
            ..Cursor::default()
        };
    }

    #[track_caller]
    fn set_subpass(&mut self, subpass: u32) {
        let Some(t1) = self.cursor.pass else {
            panic!("set_subpass without a pass");
        };
        let tree = &mut self.tree;
        let parent = &mut tree.tier1[t1 as usize];
        let fragment = SubpassFragment {
            index: subpass,
            attachments: parent.fragment.attachment_count(subpass),
        };
        let (index, replaced) = descend(parent, subpass, &mut tree.tier2, fragment, |a, b| {
            a.attachments == b.attachments
        });
        if replaced {
            tree.invalidate_tier2(index);
        }
        self.cursor.subpass = Some(index);
        self.cursor.program = None;
        self.cursor.vertex_layout = None;
        self.cursor.input_assembly = None;
    }

    #[track_caller]
    fn set_shader(&mut self, program: Arc<ShaderProgramInfo>) {
        let Some(t2) = self.cursor.subpass else {
            panic!("set_shader without a subpass");
        };
        let tree = &mut self.tree;
        let key = program.id;
        let (index, replaced) = descend(
            &mut tree.tier2[t2 as usize],
            key,
            &mut tree.tier3,
            program,
            |a, b| Arc::ptr_eq(a, b),
        );
        if replaced {
            tree.invalidate_tier3(index);
        }
        self.cursor.program = Some(index);
        self.cursor.vertex_layout = None;
        self.cursor.input_assembly = None;
    }

    #[track_caller]
    fn set_vertex_layout(&mut self, layout: Arc<VertexLayoutInfo>) {
        let Some(t3) = self.cursor.program else {
            panic!("set_vertex_layout without a shader program");
        };
        let tree = &mut self.tree;
        let key = layout.id;
        let (index, replaced) = descend(
            &mut tree.tier3[t3 as usize],
            key,
            &mut tree.tier4,
            layout,
            |a, b| Arc::ptr_eq(a, b),
        );
        if replaced {
            tree.invalidate_tier4(index);
        }
        self.cursor.vertex_layout = Some(index);
        self.cursor.input_assembly = None;
    }

    #[track_caller]
    fn set_input_layout(&mut self, input_assembly: InputAssemblyKey) {
        let Some(t4) = self.cursor.vertex_layout else {
            panic!("set_input_layout without a vertex layout");
        };
        let tree = &mut self.tree;
        let parent = &mut tree.tier4[t4 as usize];
        let existing = parent.children.get(&input_assembly).copied();
        let index = match existing {
            Some(index) => index,
            None => {
                let index = tree.tier5.len() as u32;
                tree.tier5.push(Leaf {
                    key: input_assembly,
                    initial: true,
                    generation: 0,
                    pipeline: None,
                });
                parent.children.insert(input_assembly, index);
                index
            }
        };
        self.cursor.input_assembly = Some(index);
    }

    fn apply(&mut self, request: &PipelineRequest) {
        self.set_pass(request.pass.clone());
        self.set_subpass(request.subpass);
        self.set_shader(request.program.clone());
        self.set_vertex_layout(request.vertex_layout.clone());
        self.set_input_layout(request.input_assembly);
    }
}

/// Outcome of looking up the cursor's leaf under the lock.
enum Lookup {
    Cached(DriverHandle),
    Compile {
        path: [u32; 5],
        generations: [u32; 5],
        desc: GraphicsPipelineDesc,
    },
}

impl PipelineDatabase {
    pub fn new(driver: Arc<dyn Driver>, warn_on_compile: bool) -> Self {
        Self {
            driver,
            warn_on_compile,
            state: Mutex::new(State::default()),
        }
    }

    pub fn set_pass(&self, pass: Arc<PassInfo>) {
        self.state.lock().set_pass(pass);
    }

    #[track_caller]
    pub fn set_subpass(&self, subpass: u32) {
        self.state.lock().set_subpass(subpass);
    }

    #[track_caller]
    pub fn set_shader(&self, program: Arc<ShaderProgramInfo>) {
        self.state.lock().set_shader(program);
    }

    #[track_caller]
    pub fn set_vertex_layout(&self, layout: Arc<VertexLayoutInfo>) {
        self.state.lock().set_vertex_layout(layout);
    }

    #[track_caller]
    pub fn set_input_layout(&self, input_assembly: InputAssemblyKey) {
        self.state.lock().set_input_layout(input_assembly);
    }

    /// Clear the cursor. The tree is untouched.
    pub fn reset(&self) {
        self.state.lock().cursor = Cursor::default();
    }

    /// Pipeline for the tuple selected by the `set_*` calls, compiling it if
    /// any node on its path is initial.
    #[track_caller]
    pub fn get_compiled_pipeline(&self) -> DriverResult<DriverHandle> {
        let lookup = {
            let mut state = self.state.lock();
            let path = state.cursor.path();
            Self::lookup(&mut state, path)
        };
        self.finish(lookup)
    }

    /// Select all five keys and return the matching pipeline.
    pub fn get_compiled_pipeline_for(&self, request: &PipelineRequest) -> DriverResult<DriverHandle> {
        let lookup = {
            let mut state = self.state.lock();
            state.apply(request);
            let path = state.cursor.path();
            Self::lookup(&mut state, path)
        };
        self.finish(lookup)
    }

    fn lookup(state: &mut State, path: [u32; 5]) -> Lookup {
        if state.tree.path_is_initial(path) {
            return Lookup::Compile {
                path,
                generations: state.tree.generations(path),
                desc: state.tree.describe(path),
            };
        }
        state.stats.cache_hits += 1;
        match state.tree.tier5[path[4] as usize].pipeline {
            Some(pipeline) => Lookup::Cached(pipeline),
            None => unreachable!("leaf without pipeline is always initial"),
        }
    }

    fn finish(&self, lookup: Lookup) -> DriverResult<DriverHandle> {
        let (path, generations, desc) = match lookup {
            Lookup::Cached(pipeline) => return Ok(pipeline),
            Lookup::Compile {
                path,
                generations,
                desc,
            } => (path, generations, desc),
        };

        if self.warn_on_compile && self.state.lock().warmed_up {
            warn!(
                pass = %desc.pass.name,
                program = %desc.program.name,
                subpass = desc.subpass,
                "pipeline compiled during frame"
            );
        }
        let pipeline = self.driver.create_graphics_pipeline(&desc)?;
        debug!(
            pass = %desc.pass.name,
            program = %desc.program.name,
            subpass = desc.subpass,
            raw = pipeline.raw,
            "pipeline compiled"
        );

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let leaf = &mut state.tree.tier5[path[4] as usize];
        if let Some(old) = leaf.pipeline.replace(pipeline) {
            state.retired.push(old);
        }
        state.stats.compiled += 1;
        if state.tree.generations(path) == generations {
            state.tree.clear_path(path);
        } else {
            // Invalidated mid-compile: the caller still gets this pipeline,
            // the next lookup builds a fresh one.
            debug!(pass = %desc.pass.name, "pipeline invalidated during compile");
        }
        Ok(pipeline)
    }

    /// Invalidate every pipeline built from `program`. The cursor is left
    /// where it was.
    pub fn reload(&self, program: ShaderProgramId) {
        let mut state = self.state.lock();
        let saved = state.cursor;
        let tree = &mut state.tree;
        let mut matches = Vec::new();
        for node in &tree.tier2 {
            if let Some(&index) = node.children.get(&program) {
                matches.push(index);
            }
        }
        for &index in &matches {
            tree.invalidate_tier3(index);
        }
        state.cursor = saved;
        info!(program = program.0, nodes = matches.len(), "shader program reloaded");
    }

    /// Destroy every compiled pipeline and mark every leaf for rebuild.
    /// Only valid once the device is idle.
    pub fn recreate_pipelines(&self) {
        let destroyed: Vec<DriverHandle> = {
            let mut state = self.state.lock();
            let mut destroyed: Vec<DriverHandle> = state.retired.drain(..).collect();
            for leaf in &mut state.tree.tier5 {
                leaf.invalidate();
                destroyed.extend(leaf.pipeline.take());
            }
            destroyed
        };
        for pipeline in &destroyed {
            self.driver.destroy(*pipeline);
        }
        info!(pipelines = destroyed.len(), "pipelines recreated");
    }

    /// Pipelines replaced by a rebuild. Command buffers in flight may still
    /// reference them, so the caller defers their destruction.
    pub fn take_retired_pipelines(&self) -> Vec<DriverHandle> {
        std::mem::take(&mut self.state.lock().retired)
    }

    /// Compiles from here on are logged as hitches when configured.
    pub fn finish_warmup(&self) {
        self.state.lock().warmed_up = true;
    }

    pub fn stats(&self) -> PipelineDatabaseStats {
        let state = self.state.lock();
        let tree = &state.tree;
        PipelineDatabaseStats {
            passes: tree.tier1.len(),
            subpasses: tree.tier2.len(),
            programs: tree.tier3.len(),
            vertex_layouts: tree.tier4.len(),
            pipelines: tree.tier5.iter().filter(|leaf| leaf.pipeline.is_some()).count(),
            ..state.stats
        }
    }

    /// Destroy every pipeline the database owns.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        let mut handles: Vec<DriverHandle> = state.retired.drain(..).collect();
        handles.extend(state.tree.tier5.iter_mut().filter_map(|leaf| leaf.pipeline.take()));
        *state = State::default();
        drop(state);
        for pipeline in handles {
            self.driver.destroy(pipeline);
        }
    }
}
