//! Integration test: PipelineDatabase
//!
//! Drives the five-tier cache against the capture driver and checks when
//! pipelines are compiled, reused, retired and destroyed.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::vk;
use cgfx_engine::capture::{DriverCall, FailPoint};
use cgfx_engine::error::DriverError;
use cgfx_engine::pipeline::{InputAssemblyKey, PassInfo};
use cgfx_engine::pipeline_db::{PipelineDatabase, PipelineRequest};

use common::{driver, pass, program, vertex_layout};

const LINES: InputAssemblyKey = InputAssemblyKey {
    topology: vk::PrimitiveTopology::LINE_LIST,
    primitive_restart: false,
};

#[test]
fn test_same_tuple_compiles_once() {
    let driver = driver();
    let db = PipelineDatabase::new(driver.clone(), false);
    let gbuffer = pass(&driver, 1, &[3]);
    let lit = program(&driver, 10);
    let layout = vertex_layout(100);

    let mut handles = Vec::new();
    for _ in 0..2 {
        db.set_pass(gbuffer.clone());
        db.set_subpass(0);
        db.set_shader(lit.clone());
        db.set_vertex_layout(layout.clone());
        db.set_input_layout(InputAssemblyKey::TRIANGLES);
        handles.push(db.get_compiled_pipeline().unwrap());
    }

    assert_eq!(handles[0], handles[1]);
    assert_eq!(driver.pipelines_created(), 1);
    let stats = db.stats();
    assert_eq!(stats.compiled, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.pipelines, 1);
}

#[test]
fn test_compiled_pipeline_sees_subpass_attachment_count() {
    let driver = driver();
    let db = PipelineDatabase::new(driver.clone(), false);
    let deferred = pass(&driver, 1, &[4, 1]);
    let lit = program(&driver, 10);

    for subpass in 0..2 {
        db.get_compiled_pipeline_for(&PipelineRequest {
            pass: deferred.clone(),
            subpass,
            program: lit.clone(),
            vertex_layout: vertex_layout(100),
            input_assembly: InputAssemblyKey::TRIANGLES,
        })
        .unwrap();
    }

    let attachments: Vec<(u32, u32)> = driver
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            DriverCall::CreatePipeline {
                subpass,
                color_attachments,
                ..
            } => Some((subpass, color_attachments)),
            _ => None,
        })
        .collect();
    assert_eq!(attachments, vec![(0, 4), (1, 1)]);
}

#[test]
fn test_each_topology_gets_its_own_leaf() {
    let driver = driver();
    let db = PipelineDatabase::new(driver.clone(), false);
    let forward = pass(&driver, 1, &[1]);
    let debug = program(&driver, 3);
    let layout = vertex_layout(7);

    let request = |input_assembly| PipelineRequest {
        pass: forward.clone(),
        subpass: 0,
        program: debug.clone(),
        vertex_layout: layout.clone(),
        input_assembly,
    };
    let triangles = db.get_compiled_pipeline_for(&request(InputAssemblyKey::TRIANGLES)).unwrap();
    let lines = db.get_compiled_pipeline_for(&request(LINES)).unwrap();
    assert_ne!(triangles, lines);
    assert_eq!(db.get_compiled_pipeline_for(&request(LINES)).unwrap(), lines);
    assert_eq!(driver.pipelines_created(), 2);
    assert_eq!(db.stats().vertex_layouts, 1);
}

#[test]
fn test_reload_rebuilds_only_affected_program() {
    let driver = driver();
    let db = PipelineDatabase::new(driver.clone(), false);
    let gbuffer = pass(&driver, 1, &[3]);
    let (a, b) = (program(&driver, 1), program(&driver, 2));
    let layout = vertex_layout(5);
    let request = |program| PipelineRequest {
        pass: gbuffer.clone(),
        subpass: 0,
        program,
        vertex_layout: layout.clone(),
        input_assembly: InputAssemblyKey::TRIANGLES,
    };

    let old_a = db.get_compiled_pipeline_for(&request(a.clone())).unwrap();
    let old_b = db.get_compiled_pipeline_for(&request(b.clone())).unwrap();
    assert_eq!(driver.pipelines_created(), 2);

    db.reload(a.id);

    // The unrelated tuple is still cached.
    assert_eq!(db.get_compiled_pipeline_for(&request(b.clone())).unwrap(), old_b);
    assert_eq!(driver.pipelines_created(), 2);

    let new_a = db.get_compiled_pipeline_for(&request(a.clone())).unwrap();
    assert_ne!(new_a, old_a);
    assert_eq!(driver.pipelines_created(), 3);
    assert_eq!(db.get_compiled_pipeline_for(&request(a)).unwrap(), new_a);
    assert_eq!(driver.pipelines_created(), 3);

    assert_eq!(db.take_retired_pipelines(), vec![old_a]);
    assert!(db.take_retired_pipelines().is_empty());
    // Retired pipelines are not destroyed by the database itself.
    assert_eq!(driver.destroy_count(old_a), 0);
}

#[test]
fn test_reload_during_compile_is_not_lost() {
    let driver = driver();
    let db = Arc::new(PipelineDatabase::new(driver.clone(), false));
    let lit = program(&driver, 1);
    let request = PipelineRequest {
        pass: pass(&driver, 1, &[1]),
        subpass: 0,
        program: lit.clone(),
        vertex_layout: vertex_layout(1),
        input_assembly: InputAssemblyKey::TRIANGLES,
    };

    // Another thread hot-reloads the program while the first compile runs.
    let weak = Arc::downgrade(&db);
    let reloaded = Arc::new(AtomicBool::new(false));
    let flag = reloaded.clone();
    driver.on_create_pipeline(move |desc| {
        if !flag.swap(true, Ordering::SeqCst) {
            if let Some(db) = weak.upgrade() {
                db.reload(desc.program.id);
            }
        }
    });

    let stale = db.get_compiled_pipeline_for(&request).unwrap();
    assert!(reloaded.load(Ordering::SeqCst));
    assert_eq!(driver.pipelines_created(), 1);

    let fresh = db.get_compiled_pipeline_for(&request).unwrap();
    assert_ne!(stale, fresh);
    assert_eq!(driver.pipelines_created(), 2);
    assert_eq!(db.get_compiled_pipeline_for(&request).unwrap(), fresh);
    assert_eq!(driver.pipelines_created(), 2);
    assert_eq!(db.take_retired_pipelines(), vec![stale]);
}

#[test]
fn test_failed_compile_leaves_the_leaf_initial() {
    let driver = driver();
    let db = PipelineDatabase::new(driver.clone(), false);
    let request = PipelineRequest {
        pass: pass(&driver, 1, &[1]),
        subpass: 0,
        program: program(&driver, 1),
        vertex_layout: vertex_layout(1),
        input_assembly: InputAssemblyKey::TRIANGLES,
    };

    driver.fail_after(FailPoint::CreatePipeline, 0, DriverError::OutOfDeviceMemory);
    assert!(matches!(
        db.get_compiled_pipeline_for(&request),
        Err(DriverError::OutOfDeviceMemory)
    ));
    let pipeline = db.get_compiled_pipeline_for(&request).unwrap();
    assert_eq!(driver.pipelines_created(), 1);
    assert_eq!(db.get_compiled_pipeline_for(&request).unwrap(), pipeline);
}

#[test]
fn test_reload_keeps_cursor() {
    let driver = driver();
    let db = PipelineDatabase::new(driver.clone(), false);
    let lit = program(&driver, 1);
    db.set_pass(pass(&driver, 1, &[1]));
    db.set_subpass(0);
    db.set_shader(lit.clone());
    db.set_vertex_layout(vertex_layout(1));
    db.set_input_layout(InputAssemblyKey::TRIANGLES);
    let first = db.get_compiled_pipeline().unwrap();

    db.reload(lit.id);
    let second = db.get_compiled_pipeline().unwrap();
    assert_ne!(first, second);
    assert_eq!(driver.pipelines_created(), 2);
}

#[test]
fn test_replaced_pass_fragment_invalidates_its_subtree() {
    let driver = driver();
    let db = PipelineDatabase::new(driver.clone(), false);
    let lit = program(&driver, 1);
    let layout = vertex_layout(1);
    let original = pass(&driver, 1, &[2]);
    let request = |pass: &Arc<PassInfo>| PipelineRequest {
        pass: pass.clone(),
        subpass: 0,
        program: lit.clone(),
        vertex_layout: layout.clone(),
        input_assembly: InputAssemblyKey::TRIANGLES,
    };

    let before = db.get_compiled_pipeline_for(&request(&original)).unwrap();
    // Same pass id, new fragment object: e.g. the framebuffer was resized.
    let resized = Arc::new(PassInfo::clone(&original));
    let after = db.get_compiled_pipeline_for(&request(&resized)).unwrap();

    assert_ne!(before, after);
    assert_eq!(driver.pipelines_created(), 2);
    assert_eq!(db.stats().passes, 1);
    assert_eq!(db.take_retired_pipelines(), vec![before]);
}

#[test]
fn test_recreate_pipelines_destroys_and_rebuilds() {
    let driver = driver();
    let db = PipelineDatabase::new(driver.clone(), false);
    let request = PipelineRequest {
        pass: pass(&driver, 1, &[1]),
        subpass: 0,
        program: program(&driver, 1),
        vertex_layout: vertex_layout(1),
        input_assembly: InputAssemblyKey::TRIANGLES,
    };
    let first = db.get_compiled_pipeline_for(&request).unwrap();

    db.recreate_pipelines();
    assert_eq!(driver.destroy_count(first), 1);
    assert_eq!(db.stats().pipelines, 0);

    let second = db.get_compiled_pipeline_for(&request).unwrap();
    assert_ne!(first, second);
    assert_eq!(driver.pipelines_created(), 2);
    // The destroyed pipeline is not also handed out as retired.
    assert!(db.take_retired_pipelines().is_empty());
}

#[test]
fn test_destroy_releases_every_pipeline() {
    let driver = driver();
    let db = PipelineDatabase::new(driver.clone(), false);
    let forward = pass(&driver, 1, &[1]);
    let mut created = Vec::new();
    for id in 1..=3 {
        created.push(
            db.get_compiled_pipeline_for(&PipelineRequest {
                pass: forward.clone(),
                subpass: 0,
                program: program(&driver, id),
                vertex_layout: vertex_layout(1),
                input_assembly: InputAssemblyKey::TRIANGLES,
            })
            .unwrap(),
        );
    }

    db.destroy();
    for pipeline in created {
        assert_eq!(driver.destroy_count(pipeline), 1);
    }
    assert_eq!(db.stats().passes, 0);
}

#[test]
#[should_panic(expected = "cursor is incomplete")]
fn test_incomplete_cursor_panics() {
    let driver = driver();
    let db = PipelineDatabase::new(driver.clone(), false);
    db.set_pass(pass(&driver, 1, &[1]));
    db.set_subpass(0);
    let _ = db.get_compiled_pipeline();
}

#[test]
#[should_panic(expected = "has no subpass")]
fn test_unknown_subpass_panics() {
    let driver = driver();
    let db = PipelineDatabase::new(driver.clone(), false);
    db.set_pass(pass(&driver, 1, &[1]));
    db.set_subpass(1);
}

#[test]
#[should_panic(expected = "set_shader without a subpass")]
fn test_shader_before_subpass_panics() {
    let driver = driver();
    let db = PipelineDatabase::new(driver.clone(), false);
    db.set_pass(pass(&driver, 1, &[1]));
    db.set_shader(program(&driver, 1));
}
