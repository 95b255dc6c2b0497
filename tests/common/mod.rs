pub mod hdf5_builder;
