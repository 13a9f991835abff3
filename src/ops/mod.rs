pub mod lookup;
pub mod special_colors;
