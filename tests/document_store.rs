use devcanvas_lib::storage::models::{
    BranchPatch, FrameFilter, FramePatch, MessagePatch, MessageRole, NewBranch, NewFrame, NewMessage,
    NewProject, Position, ProjectPatch, CONVERSATION_VERSION,
};
use devcanvas_lib::storage::{DocumentStore, PROJECT_SUBDIRS};
use serde_json::{json, Value};
use std::path::Path;
use tempfile::TempDir;

fn project(name: &str) -> NewProject {
    NewProject {
        name: name.to_string(),
        ..NewProject::default()
    }
}

fn read_json(path: &Path) -> Value {
    let raw = std::fs::read_to_string(path).expect("read document");
    serde_json::from_str(&raw).expect("parse document")
}

#[tokio::test]
async fn demo_canvas_frame_scenario() {
    let temp = TempDir::new().expect("tempdir");
    let store = DocumentStore::new(temp.path());

    let demo = store.create_project(project("Demo")).await.expect("create project");
    let dir = temp.path().join("Demo");
    assert!(dir.join("meta.json").is_file());
    for sub in PROJECT_SUBDIRS {
        assert!(dir.join(sub).is_dir(), "{sub} should exist");
    }

    let branches = store.list_branches(&demo.id).await.expect("branches");
    assert_eq!(branches.len(), 1);
    let main = &branches[0];
    assert!(main.is_default);

    let canvas = store.create_canvas(&demo.id, "Main").await.expect("canvas");
    let frame = store
        .create_frame(
            &demo.id,
            NewFrame {
                canvas_id: canvas.id.clone(),
                branch_id: main.id.clone(),
                name: "Home".to_string(),
                url: "http://localhost:3000".to_string(),
                ..NewFrame::default()
            },
        )
        .await
        .expect("frame");

    let by_branch = FrameFilter {
        branch_id: Some(main.id.clone()),
        ..FrameFilter::default()
    };
    let frames = store.list_frames(&demo.id, &by_branch).await.expect("list frames");
    assert_eq!(frames, vec![frame.clone()]);

    assert!(store.delete_frame(&demo.id, &frame.id).await.expect("delete frame"));
    let by_canvas = FrameFilter {
        canvas_id: Some(canvas.id.clone()),
        ..FrameFilter::default()
    };
    assert!(store.list_frames(&demo.id, &by_canvas).await.expect("list").is_empty());
}

#[tokio::test]
async fn frames_require_existing_parents() {
    let temp = TempDir::new().expect("tempdir");
    let store = DocumentStore::new(temp.path());
    let demo = store.create_project(project("Demo")).await.expect("create");
    let canvas = store.create_canvas(&demo.id, "Main").await.expect("canvas");
    let main = store
        .get_default_branch(&demo.id)
        .await
        .expect("default")
        .expect("default branch exists");

    let missing_canvas = store
        .create_frame(
            &demo.id,
            NewFrame {
                canvas_id: "no-such-canvas".to_string(),
                branch_id: main.id.clone(),
                ..NewFrame::default()
            },
        )
        .await
        .expect_err("canvas must exist");
    assert!(missing_canvas.is_not_found());

    let missing_branch = store
        .create_frame(
            &demo.id,
            NewFrame {
                canvas_id: canvas.id.clone(),
                branch_id: "no-such-branch".to_string(),
                ..NewFrame::default()
            },
        )
        .await
        .expect_err("branch must exist");
    assert!(missing_branch.is_not_found());

    assert!(store.create_canvas("no-such-project", "x").await.is_err());
    assert!(store.get_canvas(&demo.id, "no-such-canvas").await.expect("get").is_none());
}

#[tokio::test]
async fn frames_move_between_branches() {
    let temp = TempDir::new().expect("tempdir");
    let store = DocumentStore::new(temp.path());
    let demo = store.create_project(project("Demo")).await.expect("create");
    let canvas = store.create_canvas(&demo.id, "Main").await.expect("canvas");
    let main = store.ensure_default_branch(&demo.id).await.expect("main");
    let feature = store
        .create_branch(
            &demo.id,
            NewBranch {
                name: "feature".to_string(),
                ..NewBranch::default()
            },
        )
        .await
        .expect("feature branch");
    assert!(!feature.is_default);

    let frame = store
        .create_frame(
            &demo.id,
            NewFrame {
                canvas_id: canvas.id.clone(),
                branch_id: main.id.clone(),
                ..NewFrame::default()
            },
        )
        .await
        .expect("frame");
    let moved = store
        .update_frame(
            &demo.id,
            &frame.id,
            FramePatch {
                branch_id: Some(feature.id.clone()),
                position: Some(Position { x: 40.0, y: 12.0 }),
                ..FramePatch::default()
            },
        )
        .await
        .expect("update frame");
    assert_eq!(moved.branch_id, feature.id);
    assert_eq!(moved.position, Position { x: 40.0, y: 12.0 });

    let on_main = FrameFilter {
        branch_id: Some(main.id.clone()),
        ..FrameFilter::default()
    };
    assert!(store.list_frames(&demo.id, &on_main).await.expect("list").is_empty());

    // Deleting the branch takes its frames with it.
    assert!(store.delete_branch(&demo.id, &feature.id).await.expect("delete branch"));
    assert!(store.get_frame(&demo.id, &frame.id).await.expect("get").is_none());
}

#[tokio::test]
async fn default_branch_is_promoted_and_last_branch_kept() {
    let temp = TempDir::new().expect("tempdir");
    let store = DocumentStore::new(temp.path());
    let demo = store.create_project(project("Demo")).await.expect("create");
    let main = store.ensure_default_branch(&demo.id).await.expect("main");
    let next = store
        .create_branch(
            &demo.id,
            NewBranch {
                name: "next".to_string(),
                ..NewBranch::default()
            },
        )
        .await
        .expect("next");

    assert!(store.delete_branch(&demo.id, &main.id).await.expect("delete default"));
    let promoted = store
        .get_default_branch(&demo.id)
        .await
        .expect("default")
        .expect("a default remains");
    assert_eq!(promoted.id, next.id);
    assert!(promoted.is_default);

    assert!(store.delete_branch(&demo.id, &next.id).await.is_err());
    assert!(!store.delete_branch(&demo.id, "no-such-branch").await.expect("missing"));

    let renamed = store
        .update_branch(
            &demo.id,
            &next.id,
            BranchPatch {
                name: Some("trunk".to_string()),
                ..BranchPatch::default()
            },
        )
        .await
        .expect("rename branch");
    assert_eq!(renamed.name, "trunk");
}

#[tokio::test]
async fn rename_collision_gets_suffix_and_is_stable() {
    let temp = TempDir::new().expect("tempdir");
    let store = DocumentStore::new(temp.path());
    let foo = store.create_project(project("Foo")).await.expect("foo");
    let bar = store.create_project(project("Bar")).await.expect("bar");

    let rename_to_bar = || ProjectPatch {
        name: Some("Bar".to_string()),
        ..ProjectPatch::default()
    };

    let renamed = store.update_project(&foo.id, rename_to_bar()).await.expect("rename");
    assert_eq!(renamed.name, "Bar");
    assert_eq!(renamed.id, foo.id);
    let moved_to = temp.path().join("Bar (1)");
    assert_eq!(store.project_dir(&foo.id).await.expect("dir"), Some(moved_to.clone()));
    assert!(!temp.path().join("Foo").exists());

    store.update_project(&foo.id, rename_to_bar()).await.expect("rename again");
    assert_eq!(store.project_dir(&foo.id).await.expect("dir"), Some(moved_to));
    assert_eq!(
        store.project_dir(&bar.id).await.expect("dir"),
        Some(temp.path().join("Bar"))
    );

    // A fresh store finds both through a scan.
    let reopened = DocumentStore::new(temp.path());
    assert_eq!(reopened.rebuild_index().await.expect("scan"), 2);
    assert_eq!(
        reopened.get_project(&foo.id).await.expect("get").map(|p| p.name),
        Some("Bar".to_string())
    );
}

#[tokio::test]
async fn list_projects_orders_by_update_and_skips_broken() {
    let temp = TempDir::new().expect("tempdir");
    let store = DocumentStore::new(temp.path());
    let older = store.create_project(project("Older")).await.expect("older");
    let newer = store.create_project(project("Newer")).await.expect("newer");
    store
        .update_project(
            &older.id,
            ProjectPatch {
                description: Some("touched".to_string()),
                ..ProjectPatch::default()
            },
        )
        .await
        .expect("touch older");

    let broken = temp.path().join("Broken");
    std::fs::create_dir_all(&broken).expect("broken dir");
    std::fs::write(broken.join("meta.json"), "{ not json").expect("broken meta");
    std::fs::create_dir_all(temp.path().join("Stray")).expect("stray dir");

    let ids: Vec<String> = store
        .list_projects()
        .await
        .expect("list")
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(ids, vec![older.id, newer.id]);
}

#[tokio::test]
async fn delete_project_removes_tree() {
    let temp = TempDir::new().expect("tempdir");
    let store = DocumentStore::new(temp.path());
    let demo = store.create_project(project("Demo")).await.expect("create");
    std::fs::write(temp.path().join("Demo/files/index.html"), "<h1>hi</h1>").expect("seed file");

    assert!(store.delete_project(&demo.id).await.expect("delete"));
    assert!(!temp.path().join("Demo").exists());
    assert!(store.get_project(&demo.id).await.expect("get").is_none());
    assert!(!store.delete_project(&demo.id).await.expect("delete again"));
    assert!(store.list_branches(&demo.id).await.expect("branches").is_empty());
}

#[tokio::test]
async fn missing_subdirectories_are_recreated() {
    let temp = TempDir::new().expect("tempdir");
    let store = DocumentStore::new(temp.path());
    let demo = store.create_project(project("Demo")).await.expect("create");
    std::fs::remove_dir_all(temp.path().join("Demo/conversations")).expect("remove");
    std::fs::remove_dir_all(temp.path().join("Demo/assets")).expect("remove");

    store.get_project(&demo.id).await.expect("get").expect("exists");
    assert!(temp.path().join("Demo/conversations").is_dir());
    assert!(temp.path().join("Demo/assets").is_dir());
}

#[tokio::test]
async fn preview_image_is_stored_under_previews() {
    let temp = TempDir::new().expect("tempdir");
    let store = DocumentStore::new(temp.path());
    let demo = store.create_project(project("Demo")).await.expect("create");

    let updated = store
        .save_preview_image(&demo.id, b"\x89PNG", ".PNG")
        .await
        .expect("save preview");
    assert_eq!(updated.preview_img_path.as_deref(), Some("previews/preview.png"));
    assert_eq!(
        std::fs::read(temp.path().join("Demo/previews/preview.png")).expect("read preview"),
        b"\x89PNG"
    );
}

#[tokio::test]
async fn legacy_conversation_migrates_once() {
    let temp = TempDir::new().expect("tempdir");
    let store = DocumentStore::new(temp.path());
    let demo = store.create_project(project("Demo")).await.expect("create");

    let path = temp.path().join("Demo/conversations/c1.json");
    let legacy = json!({
        "id": "c1",
        "projectId": demo.id,
        "displayName": "Hero section",
        "createdAt": "2024-03-01T10:00:00Z",
        "updatedAt": "2024-03-01T10:05:00Z",
        "messages": [
            { "id": "m2", "role": "assistant", "content": "Done", "createdAt": "2024-03-01T10:01:00Z" },
            { "id": "m1", "role": "user", "content": "Make it bold", "createdAt": "2024-03-01T10:00:30Z" }
        ]
    });
    std::fs::write(&path, serde_json::to_vec_pretty(&legacy).expect("encode")).expect("seed");

    let first = store
        .get_conversation(&demo.id, "c1")
        .await
        .expect("read")
        .expect("exists");
    assert_eq!(first.title.as_deref(), Some("Hero section"));
    let on_disk = read_json(&path);
    assert_eq!(on_disk["version"], json!(CONVERSATION_VERSION));
    assert!(on_disk.get("displayName").is_none());

    let rewritten = std::fs::read(&path).expect("read rewritten");
    let second = store
        .get_conversation(&demo.id, "c1")
        .await
        .expect("read")
        .expect("exists");
    assert_eq!(second, first);
    assert_eq!(std::fs::read(&path).expect("read again"), rewritten);

    let ids: Vec<String> = store
        .list_messages(&demo.id, "c1")
        .await
        .expect("messages")
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec!["m1".to_string(), "m2".to_string()]);
}

#[tokio::test]
async fn conversations_and_messages_round_out() {
    let temp = TempDir::new().expect("tempdir");
    let store = DocumentStore::new(temp.path());
    let demo = store.create_project(project("Demo")).await.expect("create");

    let first = store.create_conversation(&demo.id, Some("First".into())).await.expect("c1");
    let second = store.create_conversation(&demo.id, None).await.expect("c2");
    store
        .append_message(&demo.id, &first.id, NewMessage::text(MessageRole::User, "hello"))
        .await
        .expect("append");

    let listed: Vec<String> = store
        .list_conversations(&demo.id)
        .await
        .expect("list")
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(listed, vec![first.id.clone(), second.id.clone()]);

    let reply = store
        .append_message(&demo.id, &first.id, NewMessage::text(MessageRole::Assistant, "hi there"))
        .await
        .expect("append reply");
    let updated = store
        .update_message(
            &demo.id,
            &first.id,
            &reply.id,
            MessagePatch {
                applied: Some(true),
                commit_oid: Some("abc123".to_string()),
                ..MessagePatch::default()
            },
        )
        .await
        .expect("update message");
    assert_eq!(updated.applied, Some(true));
    assert_eq!(updated.conversation_id, first.id);

    let kept = vec![updated.clone()];
    let replaced = store
        .replace_messages(&demo.id, &first.id, kept)
        .await
        .expect("replace messages");
    assert_eq!(replaced.messages, vec![updated]);

    let missing = store
        .append_message(&demo.id, "no-such-conversation", NewMessage::text(MessageRole::User, "x"))
        .await
        .expect_err("conversation must exist");
    assert!(missing.is_not_found());
    assert!(store
        .list_messages(&demo.id, "no-such-conversation")
        .await
        .expect("list")
        .is_empty());

    assert!(store.delete_conversation(&demo.id, &second.id).await.expect("delete"));
    assert!(store.get_conversation(&demo.id, &second.id).await.expect("get").is_none());
}

#[tokio::test]
async fn legacy_frames_move_into_their_canvas() {
    let temp = TempDir::new().expect("tempdir");
    let store = DocumentStore::new(temp.path());
    let demo = store.create_project(project("Demo")).await.expect("create");
    let canvas = store.create_canvas(&demo.id, "Main").await.expect("canvas");
    let other = store.create_canvas(&demo.id, "Other").await.expect("other canvas");

    let legacy_dir = temp.path().join("Demo/frames");
    std::fs::create_dir_all(&legacy_dir).expect("legacy dir");
    let mine = json!({
        "id": "f1",
        "canvasId": canvas.id,
        "name": "Legacy",
        "url": "http://localhost:3000",
        "position": { "x": 10.0, "y": 20.0 },
        "dimension": { "width": 800.0, "height": 600.0 }
    });
    let theirs = json!({ "id": "f2", "canvasId": "unrelated-canvas" });
    std::fs::write(legacy_dir.join("f1.json"), mine.to_string()).expect("seed f1");
    std::fs::write(legacy_dir.join("f2.json"), theirs.to_string()).expect("seed f2");

    let loaded = store
        .get_canvas(&demo.id, &canvas.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(loaded.frames.len(), 1);
    let frame = &loaded.frames[0];
    assert_eq!(frame.id, "f1");
    assert_eq!(frame.project_id, demo.id);
    let default_branch = store.ensure_default_branch(&demo.id).await.expect("default");
    assert_eq!(frame.branch_id, default_branch.id);

    assert!(!legacy_dir.join("f1.json").exists());
    assert!(legacy_dir.join("f2.json").exists());
    let stored = read_json(&temp.path().join(format!("Demo/canvases/{}.json", canvas.id)));
    assert_eq!(stored["frames"][0]["id"], "f1");

    let untouched = store
        .get_canvas(&demo.id, &other.id)
        .await
        .expect("get")
        .expect("exists");
    assert!(untouched.frames.is_empty());
}

#[tokio::test]
async fn legacy_frame_with_taken_id_is_reassigned() {
    let temp = TempDir::new().expect("tempdir");
    let store = DocumentStore::new(temp.path());
    let demo = store.create_project(project("Demo")).await.expect("create");
    let main = store.ensure_default_branch(&demo.id).await.expect("default");
    let canvas = store.create_canvas(&demo.id, "Main").await.expect("canvas");
    let other = store.create_canvas(&demo.id, "Other").await.expect("other canvas");
    let existing = store
        .create_frame(
            &demo.id,
            NewFrame {
                canvas_id: other.id.clone(),
                branch_id: main.id.clone(),
                name: "Existing".to_string(),
                ..NewFrame::default()
            },
        )
        .await
        .expect("frame");

    let legacy_dir = temp.path().join("Demo/frames");
    std::fs::create_dir_all(&legacy_dir).expect("legacy dir");
    let clash = json!({ "id": existing.id, "canvasId": canvas.id, "name": "Legacy" });
    std::fs::write(legacy_dir.join("clash.json"), clash.to_string()).expect("seed legacy frame");

    let loaded = store
        .get_canvas(&demo.id, &canvas.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(loaded.frames.len(), 1);
    assert_eq!(loaded.frames[0].name, "Legacy");
    assert_ne!(loaded.frames[0].id, existing.id);
    assert!(!legacy_dir.exists(), "empty legacy dir should be removed");

    let mut ids: Vec<String> = store
        .list_frames(&demo.id, &FrameFilter::default())
        .await
        .expect("frames")
        .into_iter()
        .map(|f| f.id)
        .collect();
    assert_eq!(ids.len(), 2);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 2);
    let kept = store.get_frame(&demo.id, &existing.id).await.expect("get").expect("exists");
    assert_eq!(kept.name, "Existing");
}

#[tokio::test]
async fn malformed_documents_are_skipped() {
    let temp = TempDir::new().expect("tempdir");
    let store = DocumentStore::new(temp.path());
    let demo = store.create_project(project("Demo")).await.expect("create");
    let canvas = store.create_canvas(&demo.id, "Main").await.expect("canvas");

    let canvases = temp.path().join("Demo/canvases");
    std::fs::write(canvases.join("broken.json"), "{\"id\": 7}").expect("seed broken");
    std::fs::write(canvases.join("garbage.json"), "not json at all").expect("seed garbage");
    std::fs::write(canvases.join("notes.txt"), "ignored").expect("seed txt");

    let listed = store.list_canvases(&demo.id).await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, canvas.id);
}
