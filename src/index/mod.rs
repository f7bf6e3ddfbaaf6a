pub mod cow_tree;

pub use cow_tree::CowTree;
