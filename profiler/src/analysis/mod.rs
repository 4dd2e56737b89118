pub mod group_comparison;
pub mod volcano_plot;
