pub type Index = u32;
pub type Value = f64;
pub type IndexValueVec = Vec<(Index, Value)>;
pub type IndexSet = hashbrown::HashSet<Index>;
pub type DataSet = data::DataSet;
pub type Instance = data::Instance;
pub type Model = model::Model;

pub mod data;
pub mod model;
pub mod tree;
mod util;
mod vec_util;
