use std::sync::Arc;

use serde_json::json;
use strata_orm::prelude::*;

struct Blog {
    conn: Arc<Connection>,
    registry: Arc<Registry>,
    users: Arc<EntityDef>,
    posts: Arc<EntityDef>,
    comments: Arc<EntityDef>,
}

/// users / posts / comments graph:
/// Alice has two posts, Bob one, Charlie none; four comments as seeded.
async fn blog() -> Blog {
    let conn = Arc::new(
        Connection::connect("sqlite::memory:")
            .await
            .expect("connect"),
    );
    conn.execute_batch(
        "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT);
         CREATE TABLE posts (id INTEGER PRIMARY KEY AUTOINCREMENT, user_id INTEGER, title TEXT, status TEXT);
         CREATE TABLE comments (id INTEGER PRIMARY KEY AUTOINCREMENT, post_id INTEGER, user_id INTEGER, body TEXT);",
    )
    .await
    .expect("schema");

    let registry = Registry::with_connection(conn.clone());
    let users = registry.register(
        EntityDef::new("User", "users")
            .has_many("posts", "Post", "user_id", "id")
            .has_many_through(
                "all_comments",
                "Comment",
                "Post",
                "user_id",
                "post_id",
                "id",
                "id",
            ),
    );
    let posts = registry.register(
        EntityDef::new("Post", "posts")
            .has_many("comments", "Comment", "post_id", "id")
            .belongs_to("author", "User", "user_id", "id"),
    );
    let comments = registry.register(
        EntityDef::new("Comment", "comments")
            .belongs_to("author", "User", "user_id", "id")
            .belongs_to("post", "Post", "post_id", "id"),
    );

    users
        .insert(&[
            json!({"id": 1, "name": "Alice"}),
            json!({"id": 2, "name": "Bob"}),
            json!({"id": 3, "name": "Charlie"}),
        ])
        .await
        .expect("seed users");
    posts
        .insert(&[
            json!({"id": 1, "user_id": 1, "title": "Alice Post 1", "status": "published"}),
            json!({"id": 2, "user_id": 1, "title": "Alice Post 2", "status": "draft"}),
            json!({"id": 3, "user_id": 2, "title": "Bob Post 1", "status": "published"}),
        ])
        .await
        .expect("seed posts");
    comments
        .insert(&[
            json!({"id": 1, "post_id": 1, "user_id": 2, "body": "Nice"}),
            json!({"id": 2, "post_id": 1, "user_id": 3, "body": "Agreed"}),
            json!({"id": 3, "post_id": 2, "user_id": 1, "body": "Self"}),
            json!({"id": 4, "post_id": 3, "user_id": 1, "body": "Great"}),
        ])
        .await
        .expect("seed comments");

    Blog {
        conn,
        registry,
        users,
        posts,
        comments,
    }
}

fn name_of(entity: &Entity) -> String {
    entity
        .get_attribute("name")
        .unwrap()
        .as_str()
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn nested_eager_loading_walks_the_whole_path() {
    let blog = blog().await;

    let before = blog.conn.statements_run();
    let list = blog
        .users
        .query()
        .with("posts.comments.author")
        .order_by("id", Direction::Asc)
        .get()
        .await
        .expect("get");
    // users + posts + comments + authors, regardless of batch size
    assert_eq!(blog.conn.statements_run() - before, 4);

    let alice = &list[0];
    let posts = alice.related_many("posts");
    assert_eq!(posts.len(), 2);

    let first_comments = posts[0].related_many("comments");
    assert_eq!(first_comments.len(), 2);
    assert_eq!(
        name_of(first_comments[0].related_one("author").expect("author")),
        "Bob"
    );
    assert_eq!(
        name_of(first_comments[1].related_one("author").expect("author")),
        "Charlie"
    );

    assert_eq!(list[1].related_many("posts").len(), 1);
    assert_eq!(list[2].related_many("posts").len(), 0);
}

#[tokio::test]
async fn eager_loading_has_many_is_two_statements_for_any_batch() {
    let blog = blog().await;

    let before = blog.conn.statements_run();
    let list = blog.users.query().with("posts").get().await.expect("get");
    assert_eq!(blog.conn.statements_run() - before, 2);
    assert_eq!(list.len(), 3);
}

#[tokio::test]
async fn eager_constraints_apply_to_the_leaf() {
    let blog = blog().await;

    let list = blog
        .users
        .query()
        .with_constrained("posts", |q| q.filter("status", "=", "published"))
        .order_by("id", Direction::Asc)
        .get()
        .await
        .expect("get");
    assert_eq!(list[0].related_many("posts").len(), 1);
    assert_eq!(list[1].related_many("posts").len(), 1);
}

#[tokio::test]
async fn belongs_to_eager_load_assigns_owners() {
    let blog = blog().await;

    let before = blog.conn.statements_run();
    let list = blog
        .posts
        .query()
        .with("author")
        .order_by("id", Direction::Asc)
        .get()
        .await
        .expect("get");
    assert_eq!(blog.conn.statements_run() - before, 2);
    assert_eq!(name_of(list[0].related_one("author").expect("author")), "Alice");
    assert_eq!(name_of(list[2].related_one("author").expect("author")), "Bob");
}

#[tokio::test]
async fn has_many_through_collects_comments_across_posts() {
    let blog = blog().await;

    let alice = blog.users.find_or_fail(1).await.expect("alice");
    let got = alice
        .has_many_through(&blog.comments, &blog.posts, "user_id", "post_id")
        .get_many()
        .await
        .expect("through");
    let bodies: Vec<String> = got
        .iter()
        .map(|c| c.get_attribute("body").unwrap().as_str().unwrap().to_string())
        .collect();
    assert_eq!(bodies, vec!["Nice", "Agreed", "Self"]);
}

#[tokio::test]
async fn declared_through_relation_eager_loads_in_two_statements() {
    let blog = blog().await;

    let before = blog.conn.statements_run();
    let list = blog
        .users
        .query()
        .with("all_comments")
        .order_by("id", Direction::Asc)
        .get()
        .await
        .expect("get");
    // users select + through rows + finals
    assert_eq!(blog.conn.statements_run() - before, 3);

    assert_eq!(list[0].related_many("all_comments").len(), 3);
    assert_eq!(list[1].related_many("all_comments").len(), 1);
    assert_eq!(list[2].related_many("all_comments").len(), 0);
}

#[tokio::test]
async fn instance_load_reuses_the_eager_pipeline() {
    let blog = blog().await;

    let mut alice = blog.users.find_or_fail(1).await.expect("alice");
    assert!(alice.related("posts").is_none());
    alice.load(&["posts.comments"]).await.expect("load");

    let posts = alice.related_many("posts");
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0].related_many("comments").len(), 2);
}

#[tokio::test]
async fn relation_get_fetches_for_one_parent() {
    let blog = blog().await;

    let alice = blog.users.find_or_fail(1).await.expect("alice");
    let posts = alice
        .relation("posts")
        .expect("declared")
        .get_many()
        .await
        .expect("get");
    assert_eq!(posts.len(), 2);

    let post = blog.posts.find_or_fail(1).await.expect("post");
    let author = post
        .relation("author")
        .expect("declared")
        .get_one()
        .await
        .expect("get")
        .expect("row");
    assert_eq!(name_of(&author), "Alice");
}

#[tokio::test]
async fn unknown_relation_is_refused() {
    let blog = blog().await;

    let err = blog
        .users
        .query()
        .with("followers")
        .get()
        .await
        .expect_err("undeclared");
    assert!(matches!(err, OrmError::RelationUnknown(name) if name == "followers"));

    let alice = blog.users.find_or_fail(1).await.expect("alice");
    assert!(alice.relation("followers").is_err());
}

#[tokio::test]
async fn to_json_overlays_eager_loaded_relations() {
    let blog = blog().await;

    let list = blog
        .users
        .query()
        .with("posts")
        .order_by("id", Direction::Asc)
        .get()
        .await
        .expect("get");
    let json = list[0].to_json();
    assert_eq!(json["posts"][0]["title"], json!("Alice Post 1"));
    let charlie = list[2].to_json();
    assert_eq!(charlie["posts"], json!([]));
}

struct Media {
    conn: Arc<Connection>,
    _registry: Arc<Registry>,
    posts: Arc<EntityDef>,
    videos: Arc<EntityDef>,
    comments: Arc<EntityDef>,
}

async fn media() -> Media {
    let conn = Arc::new(
        Connection::connect("sqlite::memory:")
            .await
            .expect("connect"),
    );
    conn.execute_batch(
        "CREATE TABLE posts (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT);
         CREATE TABLE videos (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT);
         CREATE TABLE comments (id INTEGER PRIMARY KEY AUTOINCREMENT, commentable_type TEXT, commentable_id INTEGER, body TEXT);",
    )
    .await
    .expect("schema");

    let registry = Registry::with_connection(conn.clone());
    let posts = registry.register(EntityDef::new("Post", "posts").morph_many(
        "comments",
        "Comment",
        "commentable",
        "id",
    ));
    let videos = registry.register(EntityDef::new("Video", "videos").morph_many(
        "comments",
        "Comment",
        "commentable",
        "id",
    ));
    let comments = registry
        .register(EntityDef::new("Comment", "comments").morph_to("commentable", "commentable"));
    registry.set_morph_map([("posts", "Post"), ("videos", "Video")]);

    posts
        .insert(&[json!({"id": 1, "title": "First Post"})])
        .await
        .expect("seed posts");
    videos
        .insert(&[json!({"id": 1, "title": "First Video"})])
        .await
        .expect("seed videos");
    comments
        .insert(&[
            json!({"id": 1, "commentable_type": "posts", "commentable_id": 1, "body": "On a post"}),
            json!({"id": 2, "commentable_type": "videos", "commentable_id": 1, "body": "On a video"}),
        ])
        .await
        .expect("seed comments");

    Media {
        conn,
        _registry: registry,
        posts,
        videos,
        comments,
    }
}

#[tokio::test]
async fn morph_to_resolves_through_the_morph_map() {
    let media = media().await;

    let comment = media.comments.find_or_fail(1).await.expect("comment");
    let parent = comment
        .relation("commentable")
        .expect("declared")
        .get_one()
        .await
        .expect("get")
        .expect("row");
    assert_eq!(
        parent.get_attribute("title").unwrap(),
        Value::Str("First Post".to_string())
    );
}

#[tokio::test]
async fn morph_to_eager_load_partitions_by_type() {
    let media = media().await;

    let before = media.conn.statements_run();
    let list = media
        .comments
        .query()
        .with("commentable")
        .order_by("id", Direction::Asc)
        .get()
        .await
        .expect("get");
    // comments + one select per distinct target type
    assert_eq!(media.conn.statements_run() - before, 3);

    assert_eq!(
        list[0].related_one("commentable").expect("post").get_attribute("title").unwrap(),
        Value::Str("First Post".to_string())
    );
    assert_eq!(
        list[1].related_one("commentable").expect("video").get_attribute("title").unwrap(),
        Value::Str("First Video".to_string())
    );
}

#[tokio::test]
async fn morph_many_filters_by_the_type_discriminator() {
    let media = media().await;

    // Post 1 and Video 1 share the id; the type column keeps them apart.
    let post = media.posts.find_or_fail(1).await.expect("post");
    let post_comments = post
        .relation("comments")
        .expect("declared")
        .get_many()
        .await
        .expect("get");
    assert_eq!(post_comments.len(), 1);
    assert_eq!(
        post_comments[0].get_attribute("body").unwrap(),
        Value::Str("On a post".to_string())
    );

    let video_list = media.videos.query().with("comments").get().await.expect("get");
    assert_eq!(video_list[0].related_many("comments").len(), 1);
}

#[tokio::test]
async fn unmapped_morph_alias_is_an_error() {
    let media = media().await;
    media
        .comments
        .insert(&[json!({"id": 3, "commentable_type": "articles", "commentable_id": 1, "body": "?"})])
        .await
        .expect("seed");

    let orphan = media.comments.find_or_fail(3).await.expect("comment");
    let err = orphan
        .relation("commentable")
        .expect("declared")
        .get()
        .await
        .expect_err("unmapped");
    assert!(matches!(err, OrmError::MorphUnresolved(alias) if alias == "articles"));
}

struct Acl {
    conn: Arc<Connection>,
    _registry: Arc<Registry>,
    users: Arc<EntityDef>,
    roles: Arc<EntityDef>,
}

async fn acl() -> Acl {
    let conn = Arc::new(
        Connection::connect("sqlite::memory:")
            .await
            .expect("connect"),
    );
    conn.execute_batch(
        "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT);
         CREATE TABLE roles (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT);
         CREATE TABLE role_user (user_id INTEGER, role_id INTEGER, granted_by INTEGER, created_at TIMESTAMP, updated_at TIMESTAMP);",
    )
    .await
    .expect("schema");

    let registry = Registry::with_connection(conn.clone());
    let users = registry.register(
        EntityDef::new("User", "users")
            .belongs_to_many("roles", "Role", "role_user", "user_id", "role_id", "id", "id")
            .pivot_columns("roles", ["granted_by"])
            .pivot_timestamps("roles"),
    );
    let roles = registry.register(EntityDef::new("Role", "roles"));

    users
        .insert(&[json!({"id": 1, "name": "Alice"}), json!({"id": 2, "name": "Bob"})])
        .await
        .expect("seed users");
    roles
        .insert(&[
            json!({"id": 1, "name": "admin"}),
            json!({"id": 2, "name": "editor"}),
            json!({"id": 3, "name": "viewer"}),
        ])
        .await
        .expect("seed roles");

    Acl {
        conn,
        _registry: registry,
        users,
        roles,
    }
}

async fn role_names(user: &Entity) -> Vec<String> {
    user.relation("roles")
        .expect("declared")
        .get_many()
        .await
        .expect("get")
        .iter()
        .map(|role| role.get_attribute("name").unwrap().as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn attach_and_get_surface_the_pivot_payload() {
    let acl = acl().await;

    let alice = acl.users.find_or_fail(1).await.expect("alice");
    let rel = alice.relation("roles").expect("declared");
    rel.attach(&[1, 2]).await.expect("attach");

    let roles = rel.get_many().await.expect("get");
    assert_eq!(roles.len(), 2);
    let pivot = roles[0].raw_attribute("pivot").expect("payload");
    match pivot {
        Value::Json(obj) => {
            assert_eq!(obj["user_id"], json!(1));
            assert_eq!(obj["role_id"], json!(1));
            assert!(obj.get("created_at").is_some());
        }
        other => panic!("unexpected pivot payload: {:?}", other),
    }
}

#[tokio::test]
async fn pivot_eager_load_is_two_auxiliary_statements() {
    let acl = acl().await;
    let alice = acl.users.find_or_fail(1).await.expect("alice");
    let bob = acl.users.find_or_fail(2).await.expect("bob");
    alice.relation("roles").unwrap().attach(&[1, 2]).await.expect("attach");
    bob.relation("roles").unwrap().attach(&[3]).await.expect("attach");

    let before = acl.conn.statements_run();
    let list = acl
        .users
        .query()
        .with("roles")
        .order_by("id", Direction::Asc)
        .get()
        .await
        .expect("get");
    // users + pivot rows + related rows
    assert_eq!(acl.conn.statements_run() - before, 3);

    assert_eq!(list[0].related_many("roles").len(), 2);
    assert_eq!(list[1].related_many("roles").len(), 1);
}

#[tokio::test]
async fn sync_replaces_the_attached_set() {
    let acl = acl().await;
    let alice = acl.users.find_or_fail(1).await.expect("alice");
    let rel = alice.relation("roles").expect("declared");

    rel.attach(&[1]).await.expect("attach");
    rel.sync(&[2, 3]).await.expect("sync");
    assert_eq!(role_names(&alice).await, vec!["editor", "viewer"]);
}

#[tokio::test]
async fn sync_without_detaching_only_adds_missing_ids() {
    let acl = acl().await;
    let alice = acl.users.find_or_fail(1).await.expect("alice");
    let rel = alice.relation("roles").expect("declared");

    rel.attach(&[1]).await.expect("attach");
    rel.sync_without_detaching(&[1, 2]).await.expect("sync");
    assert_eq!(role_names(&alice).await, vec!["admin", "editor"]);
}

#[tokio::test]
async fn toggle_flips_membership() {
    let acl = acl().await;
    let alice = acl.users.find_or_fail(1).await.expect("alice");
    let rel = alice.relation("roles").expect("declared");

    rel.attach(&[1, 2]).await.expect("attach");
    rel.toggle(&[2, 3]).await.expect("toggle");
    assert_eq!(role_names(&alice).await, vec!["admin", "viewer"]);
}

#[tokio::test]
async fn detach_removes_some_or_all() {
    let acl = acl().await;
    let alice = acl.users.find_or_fail(1).await.expect("alice");
    let rel = alice.relation("roles").expect("declared");

    rel.attach(&[1, 2, 3]).await.expect("attach");
    assert_eq!(rel.detach(Some(&[2])).await.expect("detach"), 1);
    assert_eq!(role_names(&alice).await, vec!["admin", "viewer"]);
    assert_eq!(rel.detach(None).await.expect("detach all"), 2);
    assert!(role_names(&alice).await.is_empty());
}

#[tokio::test]
async fn update_existing_pivot_rewrites_the_payload() {
    let acl = acl().await;
    let alice = acl.users.find_or_fail(1).await.expect("alice");
    let rel = alice.relation("roles").expect("declared");

    rel.attach(&[1]).await.expect("attach");
    let changed = rel
        .update_existing_pivot(1, &json!({"granted_by": 2}))
        .await
        .expect("update pivot");
    assert_eq!(changed, 1);

    let roles = rel.get_many().await.expect("get");
    match roles[0].raw_attribute("pivot").expect("payload") {
        Value::Json(obj) => assert_eq!(obj["granted_by"], json!(2)),
        other => panic!("unexpected pivot payload: {:?}", other),
    }
}

#[tokio::test]
async fn create_persists_and_attaches() {
    let acl = acl().await;
    let alice = acl.users.find_or_fail(1).await.expect("alice");
    let rel = alice.relation("roles").expect("declared");

    let owner = rel
        .create(&json!({"name": "owner"}), None)
        .await
        .expect("create");
    assert!(owner.exists());
    assert_eq!(role_names(&alice).await, vec!["owner"]);
    assert_eq!(acl.roles.count().await.expect("count"), 4);
}

#[tokio::test]
async fn belongs_to_with_default_supplies_a_placeholder() {
    let blog = blog().await;
    let registry = &blog.registry;
    let orphan_posts = registry.register(
        EntityDef::new("OrphanPost", "posts")
            .belongs_to("author", "User", "user_id", "id")
            .with_default("author", json!({"name": "Anonymous"})),
    );
    blog.posts
        .insert(&[json!({"id": 9, "title": "Drifting", "user_id": null})])
        .await
        .expect("seed");

    let drifting = orphan_posts.find_or_fail(9).await.expect("post");
    let author = drifting
        .relation("author")
        .expect("declared")
        .get_one()
        .await
        .expect("get")
        .expect("default");
    assert!(!author.exists());
    assert_eq!(name_of(&author), "Anonymous");

    let list = orphan_posts
        .query()
        .filter("id", "=", 9)
        .with("author")
        .get()
        .await
        .expect("eager");
    assert_eq!(name_of(list[0].related_one("author").expect("default")), "Anonymous");
}

#[tokio::test]
async fn saving_a_child_touches_its_parent() {
    let conn = Arc::new(
        Connection::connect("sqlite::memory:")
            .await
            .expect("connect"),
    );
    conn.execute_batch(
        "CREATE TABLE posts (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT, updated_at TIMESTAMP);
         CREATE TABLE comments (id INTEGER PRIMARY KEY AUTOINCREMENT, post_id INTEGER, body TEXT);",
    )
    .await
    .expect("schema");

    let registry = Registry::with_connection(conn.clone());
    let posts = registry.register(EntityDef::new("Post", "posts"));
    let comments = registry.register(
        EntityDef::new("Comment", "comments")
            .belongs_to("post", "Post", "post_id", "id")
            .touches("post"),
    );

    posts
        .insert(&[json!({"id": 1, "title": "Quiet"})])
        .await
        .expect("seed");
    let before = posts.find_or_fail(1).await.expect("post");
    assert_eq!(before.raw_attribute("updated_at"), Some(&Value::Null));

    comments
        .create(&json!({"post_id": 1, "body": "Wake up"}))
        .await
        .expect("create");

    let after = posts.find_or_fail(1).await.expect("post");
    assert!(!after.get_attribute("updated_at").unwrap().is_null());
}
