pub mod activation;
pub mod economy;
pub mod item_types;
pub mod loot;
pub mod participants;
pub mod position;
pub mod position_locks;
pub mod registry;
pub mod scheduler;
pub mod spawner;
pub mod time;
pub mod timed_lock;
