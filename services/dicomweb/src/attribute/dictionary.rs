//! Minimal data dictionary.
//!
//! Covers the attributes the engine projects or queries on, plus the common
//! image and sequence attributes needed to walk implicit VR datasets.
//! Anything else read from implicit VR input decodes as `UN`.

use super::{Tag, Vr};

struct Entry {
    tag: Tag,
    vr: Vr,
    keyword: &'static str,
}

const fn entry(group: u16, element: u16, vr: Vr, keyword: &'static str) -> Entry {
    Entry {
        tag: Tag(group, element),
        vr,
        keyword,
    }
}

static ENTRIES: &[Entry] = &[
    entry(0x0002, 0x0001, Vr::OB, "FileMetaInformationVersion"),
    entry(0x0002, 0x0002, Vr::UI, "MediaStorageSOPClassUID"),
    entry(0x0002, 0x0003, Vr::UI, "MediaStorageSOPInstanceUID"),
    entry(0x0002, 0x0010, Vr::UI, "TransferSyntaxUID"),
    entry(0x0002, 0x0012, Vr::UI, "ImplementationClassUID"),
    entry(0x0002, 0x0013, Vr::SH, "ImplementationVersionName"),
    entry(0x0008, 0x0005, Vr::CS, "SpecificCharacterSet"),
    entry(0x0008, 0x0008, Vr::CS, "ImageType"),
    entry(0x0008, 0x0012, Vr::DA, "InstanceCreationDate"),
    entry(0x0008, 0x0013, Vr::TM, "InstanceCreationTime"),
    entry(0x0008, 0x0016, Vr::UI, "SOPClassUID"),
    entry(0x0008, 0x0018, Vr::UI, "SOPInstanceUID"),
    entry(0x0008, 0x0020, Vr::DA, "StudyDate"),
    entry(0x0008, 0x0021, Vr::DA, "SeriesDate"),
    entry(0x0008, 0x0022, Vr::DA, "AcquisitionDate"),
    entry(0x0008, 0x0023, Vr::DA, "ContentDate"),
    entry(0x0008, 0x0030, Vr::TM, "StudyTime"),
    entry(0x0008, 0x0031, Vr::TM, "SeriesTime"),
    entry(0x0008, 0x0032, Vr::TM, "AcquisitionTime"),
    entry(0x0008, 0x0033, Vr::TM, "ContentTime"),
    entry(0x0008, 0x0050, Vr::SH, "AccessionNumber"),
    entry(0x0008, 0x0060, Vr::CS, "Modality"),
    entry(0x0008, 0x0061, Vr::CS, "ModalitiesInStudy"),
    entry(0x0008, 0x0070, Vr::LO, "Manufacturer"),
    entry(0x0008, 0x0080, Vr::LO, "InstitutionName"),
    entry(0x0008, 0x0090, Vr::PN, "ReferringPhysicianName"),
    entry(0x0008, 0x1030, Vr::LO, "StudyDescription"),
    entry(0x0008, 0x103E, Vr::LO, "SeriesDescription"),
    entry(0x0008, 0x1090, Vr::LO, "ManufacturerModelName"),
    entry(0x0008, 0x1140, Vr::SQ, "ReferencedImageSequence"),
    entry(0x0008, 0x1150, Vr::UI, "ReferencedSOPClassUID"),
    entry(0x0008, 0x1155, Vr::UI, "ReferencedSOPInstanceUID"),
    entry(0x0008, 0x3002, Vr::UI, "AvailableTransferSyntaxUID"),
    entry(0x0010, 0x0010, Vr::PN, "PatientName"),
    entry(0x0010, 0x0020, Vr::LO, "PatientID"),
    entry(0x0010, 0x0021, Vr::LO, "IssuerOfPatientID"),
    entry(0x0010, 0x0030, Vr::DA, "PatientBirthDate"),
    entry(0x0010, 0x0040, Vr::CS, "PatientSex"),
    entry(0x0010, 0x1010, Vr::AS, "PatientAge"),
    entry(0x0018, 0x0015, Vr::CS, "BodyPartExamined"),
    entry(0x0018, 0x0050, Vr::DS, "SliceThickness"),
    entry(0x0020, 0x000D, Vr::UI, "StudyInstanceUID"),
    entry(0x0020, 0x000E, Vr::UI, "SeriesInstanceUID"),
    entry(0x0020, 0x0010, Vr::SH, "StudyID"),
    entry(0x0020, 0x0011, Vr::IS, "SeriesNumber"),
    entry(0x0020, 0x0013, Vr::IS, "InstanceNumber"),
    entry(0x0020, 0x0032, Vr::DS, "ImagePositionPatient"),
    entry(0x0020, 0x0037, Vr::DS, "ImageOrientationPatient"),
    entry(0x0020, 0x0052, Vr::UI, "FrameOfReferenceUID"),
    entry(0x0020, 0x1206, Vr::IS, "NumberOfStudyRelatedSeries"),
    entry(0x0020, 0x1208, Vr::IS, "NumberOfStudyRelatedInstances"),
    entry(0x0020, 0x1209, Vr::IS, "NumberOfSeriesRelatedInstances"),
    entry(0x0028, 0x0002, Vr::US, "SamplesPerPixel"),
    entry(0x0028, 0x0004, Vr::CS, "PhotometricInterpretation"),
    entry(0x0028, 0x0006, Vr::US, "PlanarConfiguration"),
    entry(0x0028, 0x0008, Vr::IS, "NumberOfFrames"),
    entry(0x0028, 0x0010, Vr::US, "Rows"),
    entry(0x0028, 0x0011, Vr::US, "Columns"),
    entry(0x0028, 0x0030, Vr::DS, "PixelSpacing"),
    entry(0x0028, 0x0100, Vr::US, "BitsAllocated"),
    entry(0x0028, 0x0101, Vr::US, "BitsStored"),
    entry(0x0028, 0x0102, Vr::US, "HighBit"),
    entry(0x0028, 0x0103, Vr::US, "PixelRepresentation"),
    entry(0x0028, 0x1050, Vr::DS, "WindowCenter"),
    entry(0x0028, 0x1051, Vr::DS, "WindowWidth"),
    entry(0x0028, 0x1052, Vr::DS, "RescaleIntercept"),
    entry(0x0028, 0x1053, Vr::DS, "RescaleSlope"),
    entry(0x0040, 0x0244, Vr::DA, "PerformedProcedureStepStartDate"),
    entry(0x0040, 0x0275, Vr::SQ, "RequestAttributesSequence"),
    entry(0x0042, 0x0011, Vr::OB, "EncapsulatedDocument"),
    entry(0x0054, 0x0016, Vr::SQ, "RadiopharmaceuticalInformationSequence"),
    entry(0x5200, 0x9229, Vr::SQ, "SharedFunctionalGroupsSequence"),
    entry(0x5200, 0x9230, Vr::SQ, "PerFrameFunctionalGroupsSequence"),
    entry(0x7FE0, 0x0001, Vr::OV, "ExtendedOffsetTable"),
    entry(0x7FE0, 0x0002, Vr::OV, "ExtendedOffsetTableLengths"),
    entry(0x7FE0, 0x0010, Vr::OW, "PixelData"),
];

/// VR of a tag for implicit VR decoding.
pub fn vr_of(tag: Tag) -> Option<Vr> {
    if tag.is_group_length() {
        return Some(Vr::UL);
    }
    if tag.is_private_creator() {
        return Some(Vr::LO);
    }
    ENTRIES.iter().find(|e| e.tag == tag).map(|e| e.vr)
}

pub fn keyword_of(tag: Tag) -> Option<&'static str> {
    ENTRIES.iter().find(|e| e.tag == tag).map(|e| e.keyword)
}

/// Resolve a query parameter name, either a keyword or 8-digit hex tag.
pub fn resolve(name: &str) -> Option<Tag> {
    ENTRIES
        .iter()
        .find(|e| e.keyword == name)
        .map(|e| e.tag)
        .or_else(|| name.parse().ok())
}
