// SPDX-License-Identifier: GPL-3.0-only

/// Message definitions for the subset of AOSP's `update_metadata.proto` that
/// the dumper consumes. The structs mirror prost-build output and are
/// maintained by hand; tag numbers and optionality must match the upstream
/// schema. prost skips unknown fields, so full manifests decode cleanly.
pub mod chromeos_update_engine {
    /// Data is packed into blocks on disk. Each block is addressed by its
    /// index rather than a byte offset.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Extent {
        #[prost(uint64, optional, tag = "1")]
        pub start_block: ::core::option::Option<u64>,
        #[prost(uint64, optional, tag = "2")]
        pub num_blocks: ::core::option::Option<u64>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PartitionInfo {
        #[prost(uint64, optional, tag = "1")]
        pub size: ::core::option::Option<u64>,
        #[prost(bytes = "vec", optional, tag = "2")]
        pub hash: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    }

    /// One step of an update: write a blob, zero a range, or transform data
    /// from the source partition into the target partition.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InstallOperation {
        #[prost(enumeration = "install_operation::Type", required, tag = "1")]
        pub r#type: i32,
        /// Offset into the payload's blob section, when the operation carries
        /// data.
        #[prost(uint64, optional, tag = "2")]
        pub data_offset: ::core::option::Option<u64>,
        #[prost(uint64, optional, tag = "3")]
        pub data_length: ::core::option::Option<u64>,
        #[prost(message, repeated, tag = "4")]
        pub src_extents: ::prost::alloc::vec::Vec<Extent>,
        #[prost(message, repeated, tag = "6")]
        pub dst_extents: ::prost::alloc::vec::Vec<Extent>,
        /// SHA-256 of the blob data exactly as stored (before decompression).
        #[prost(bytes = "vec", optional, tag = "8")]
        pub data_sha256_hash: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    }

    /// Nested message and enum types in `InstallOperation`.
    pub mod install_operation {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
        )]
        #[repr(i32)]
        pub enum Type {
            /// Replace destination extents with attached data.
            Replace = 0,
            /// Move source extents to target extents.
            Move = 1,
            /// The data is a bsdiff binary diff.
            Bsdiff = 2,
            /// Replace destination extents with attached bzipped data.
            ReplaceBz = 3,
            /// Copy from source to target partition.
            SourceCopy = 4,
            /// Like Bsdiff, but takes the data from the source partition.
            SourceBsdiff = 5,
            /// Write zeros to the destination.
            Zero = 6,
            /// Discard the destination blocks.
            Discard = 7,
            /// Replace destination extents with attached xz data.
            ReplaceXz = 8,
            Puffdiff = 9,
            BrotliBsdiff = 10,
            Zucchini = 11,
            Lz4diffBsdiff = 12,
            Lz4diffPuffdiff = 13,
            /// Replace destination extents with attached zstd data.
            Zstd = 14,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PartitionUpdate {
        /// A platform-specific name to identify the partition set being
        /// updated, eg. "system" or "boot".
        #[prost(string, required, tag = "1")]
        pub partition_name: ::prost::alloc::string::String,
        #[prost(message, optional, tag = "6")]
        pub old_partition_info: ::core::option::Option<PartitionInfo>,
        #[prost(message, optional, tag = "7")]
        pub new_partition_info: ::core::option::Option<PartitionInfo>,
        /// The list of operations to be performed to apply this
        /// PartitionUpdate. The associated operation blobs (in
        /// operations[i].data_offset, data_length) should be stored
        /// contiguously and in the same order.
        #[prost(message, repeated, tag = "8")]
        pub operations: ::prost::alloc::vec::Vec<InstallOperation>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeltaArchiveManifest {
        /// The size used to align partition data to blocks.
        #[prost(uint32, optional, tag = "3", default = "4096")]
        pub block_size: ::core::option::Option<u32>,
        /// Describes the update to each partition.
        #[prost(message, repeated, tag = "13")]
        pub partitions: ::prost::alloc::vec::Vec<PartitionUpdate>,
    }
}
