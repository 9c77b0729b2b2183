//! Database migrations

use sea_orm_migration::prelude::*;

mod m20260901_000001_create_task_queues;
mod m20260915_000001_create_tunnel_sessions;
mod m20261002_000001_add_delivery_id;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260901_000001_create_task_queues::Migration),
            Box::new(m20260915_000001_create_tunnel_sessions::Migration),
            Box::new(m20261002_000001_add_delivery_id::Migration),
        ]
    }
}
