pub mod assembler;
pub mod catalog;
pub mod chunk_store;
pub mod map_records;
pub mod map_service;
pub mod raster;
pub mod shapefile;
