//! Reading and writing of array container files: the classic CDF-1/
//! CDF-2 format (read and write) and a subset of the HDF5-style
//! hierarchical format (read only).
//!
//! Both codecs parse into one shared data model of dimensions,
//! attributes, variables, and groups, and both serve strided section
//! reads through the same [`indexer::Indexer`]. Open a file with
//! [`open`], [`open_mmap`], or [`NcFile::open`] over any
//! [`RandomAccess`] source; build a new classic file with
//! [`DatasetBuilder`].

pub mod classic_reader;
pub mod classic_writer;
pub mod error;
pub mod hdf5_chunks;
pub mod hdf5_reader;
pub mod indexer;
pub mod io;
pub mod models;
pub mod open;
pub mod read;
pub mod section;
pub mod utils;

pub use classic_reader::ClassicFile;
pub use classic_writer::{DatasetBuilder, WritableDataset};
pub use error::Error;
pub use hdf5_reader::Hdf5File;
pub use io::{MmapSource, RandomAccess};
pub use models::{
    Attribute, AttrValue, DataType, Dataset, Dimension, Endianness, Group, NumericValues,
    Variable,
};
pub use open::{open, open_mmap, sniff, FormatKind, NcFile};
pub use read::Element;
pub use section::{Range, Section};

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn classic_round_trip_fixed_variable() -> Result<(), Error> {
        let mut builder = DatasetBuilder::new();
        builder
            .add_dimension("lat", 2)?
            .add_dimension("lon", 3)?
            .add_variable("temp", DataType::Float, &["lat", "lon"])?
            .add_attribute(Attribute::string("title", "round trip")?);

        let mut file = builder.create(Cursor::new(Vec::new()))?;
        let values = NumericValues::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        file.write("temp", &[0, 0], &[2, 3], &values)?;
        let buffer = file.close()?;

        let mut read_back = ClassicFile::open(buffer, false)?;
        let title = read_back
            .dataset
            .root()
            .attributes
            .iter()
            .find(|a| a.name() == "title")
            .and_then(|a| a.as_string())
            .map(str::to_string);
        assert_eq!(title.as_deref(), Some("round trip"));
        assert_eq!(read_back.read("temp")?, values);

        // Middle column only.
        let col = Section::new(vec![None, Some(Range::new(1, 1, 1)?)]);
        assert_eq!(
            read_back.read_section("temp", &col)?,
            NumericValues::F32(vec![2.0, 5.0])
        );
        Ok(())
    }

    #[test]
    fn classic_round_trip_record_variables() -> Result<(), Error> {
        let mut builder = DatasetBuilder::new();
        builder
            .add_unlimited_dimension("time")?
            .add_dimension("x", 2)?
            .add_variable("a", DataType::Int, &["time", "x"])?
            .add_variable("b", DataType::Short, &["time"])?;

        let mut file = builder.create(Cursor::new(Vec::new()))?;
        file.write(
            "a",
            &[0, 0],
            &[3, 2],
            &NumericValues::I32(vec![1, 2, 3, 4, 5, 6]),
        )?;
        file.write("b", &[0], &[3], &NumericValues::I16(vec![10, 20, 30]))?;
        let buffer = file.close()?;

        let mut read_back = ClassicFile::open(buffer, false)?;
        assert_eq!(read_back.dataset.num_records, 3);
        assert_eq!(
            read_back.read("a")?,
            NumericValues::I32(vec![1, 2, 3, 4, 5, 6])
        );
        // Records interleave on disk; a strided section still lands right.
        let odd = Section::new(vec![Some(Range::new(1, 2, 1)?)]);
        assert_eq!(
            read_back.read_section("b", &odd)?,
            NumericValues::I16(vec![20, 30])
        );
        Ok(())
    }

    #[test]
    fn classic_64bit_offsets_round_trip() -> Result<(), Error> {
        let mut builder = DatasetBuilder::new().with_64bit_offsets();
        builder
            .add_dimension("n", 4)?
            .add_variable("v", DataType::Double, &["n"])?;
        let mut file = builder.create(Cursor::new(Vec::new()))?;
        file.write(
            "v",
            &[0],
            &[4],
            &NumericValues::F64(vec![0.5, 1.5, 2.5, 3.5]),
        )?;
        let buffer = file.close()?;

        let mut read_back = ClassicFile::open(buffer, false)?;
        assert_eq!(read_back.version, 2);
        assert_eq!(
            read_back.read_section_as::<f64>("v", &Section::all(1))?,
            vec![0.5, 1.5, 2.5, 3.5]
        );
        Ok(())
    }

    #[test]
    fn sniff_and_open_dispatch_to_classic() -> Result<(), Error> {
        let mut builder = DatasetBuilder::new();
        builder
            .add_dimension("n", 1)?
            .add_variable("v", DataType::Byte, &["n"])?;
        let mut file = builder.create(Cursor::new(Vec::new()))?;
        file.write("v", &[0], &[1], &NumericValues::I8(vec![7]))?;
        let buffer = file.close()?;

        let mut nc = NcFile::open(buffer)?;
        assert_eq!(nc.format(), FormatKind::Classic);
        assert_eq!(nc.read("v")?, NumericValues::I8(vec![7]));
        Ok(())
    }

    #[test]
    fn typed_read_rejects_wrong_element_type() -> Result<(), Error> {
        let mut builder = DatasetBuilder::new();
        builder
            .add_dimension("n", 2)?
            .add_variable("v", DataType::Int, &["n"])?;
        let mut file = builder.create(Cursor::new(Vec::new()))?;
        file.write("v", &[0], &[2], &NumericValues::I32(vec![1, 2]))?;
        let buffer = file.close()?;

        let mut read_back = ClassicFile::open(buffer, false)?;
        assert!(matches!(
            read_back.read_section_as::<f32>("v", &Section::all(1)),
            Err(Error::TypeMismatch { .. })
        ));
        Ok(())
    }
}
