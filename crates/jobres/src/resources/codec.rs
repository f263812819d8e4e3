use crate::error::inconsistency;
use crate::pack::{Packer, UnpackError, Unpacker};
use crate::protocol::{NO_VAL, PROTOCOL_VERSION, format_version, is_supported_version};
use crate::resources::{CrType, JobResources, NodeReq};

fn check_version(version: u16) -> crate::Result<()> {
    if !is_supported_version(version) {
        return Err(UnpackError::invalid(
            "protocol version",
            format!("unsupported version {}", format_version(version)),
        )
        .into());
    }
    Ok(())
}

fn check_per_node_len(what: &'static str, len: usize, nhosts: usize) -> crate::Result<()> {
    if len != 0 && len != nhosts {
        return inconsistency(format!("{what} has {len} entries for {nhosts} hosts"));
    }
    Ok(())
}

impl JobResources {
    /// Serializes the structure in the layout of `version`.
    ///
    /// `node_bitmap` is not transmitted; receivers rebuild it from `nodes` with
    /// [`JobResources::reset_node_bitmap`].
    pub fn pack(&self, packer: &mut Packer, version: u16) -> crate::Result<()> {
        check_version(version)?;
        packer.pack32(self.nhosts);
        packer.pack32(self.ncpus);
        packer.pack32(self.node_req.as_u32());
        packer.pack_str(self.nodes.as_deref());
        packer.pack8(self.whole_node as u8);
        if version >= PROTOCOL_VERSION {
            packer.pack16(self.threads_per_core);
            packer.pack16(self.cr_type.bits());
        }
        packer.pack32_array(&self.cpu_array_reps);
        packer.pack16_array(&self.cpu_array_value);
        packer.pack16_array(&self.cpus);
        packer.pack16_array(&self.cpus_used);
        packer.pack64_array(&self.memory_allocated);
        packer.pack64_array(&self.memory_used);
        packer.pack16_array(&self.sockets_per_node);
        packer.pack16_array(&self.cores_per_socket);
        packer.pack32_array(&self.sock_core_rep_count);
        packer.pack_bitmap_hex(self.core_bitmap.as_ref());
        packer.pack_bitmap_hex(self.core_bitmap_used.as_ref());
        Ok(())
    }

    /// Packs `NO_VAL` in place of a missing record.
    pub fn pack_optional(
        resources: Option<&JobResources>,
        packer: &mut Packer,
        version: u16,
    ) -> crate::Result<()> {
        match resources {
            Some(resources) => resources.pack(packer, version),
            None => {
                check_version(version)?;
                packer.pack32(NO_VAL);
                Ok(())
            }
        }
    }

    /// Reads a record written by [`JobResources::pack_optional`] in the layout of `version`.
    pub fn unpack(unpacker: &mut Unpacker, version: u16) -> crate::Result<Option<JobResources>> {
        check_version(version)?;
        let nhosts = unpacker.unpack32()?;
        if nhosts == NO_VAL {
            return Ok(None);
        }
        let mut jr = JobResources {
            nhosts,
            ncpus: unpacker.unpack32()?,
            ..Default::default()
        };
        let node_req = unpacker.unpack32()?;
        jr.node_req = NodeReq::from_u32(node_req).ok_or_else(|| {
            UnpackError::invalid("node_req", format!("unknown value {node_req}"))
        })?;
        jr.nodes = unpacker.unpack_str()?;
        jr.whole_node = unpacker.unpack8()? != 0;
        if version >= PROTOCOL_VERSION {
            jr.threads_per_core = unpacker.unpack16()?;
            jr.cr_type = CrType::from_bits_retain(unpacker.unpack16()?);
        }

        jr.cpu_array_reps = unpacker.unpack32_array()?;
        jr.cpu_array_value = unpacker.unpack16_array()?;
        if jr.cpu_array_reps.len() != jr.cpu_array_value.len() {
            return inconsistency(format!(
                "cpu_array_reps has {} entries, cpu_array_value {}",
                jr.cpu_array_reps.len(),
                jr.cpu_array_value.len()
            ));
        }

        let hosts = nhosts as usize;
        jr.cpus = unpacker.unpack16_array()?;
        if jr.cpus.len() != hosts {
            return inconsistency(format!(
                "cpus has {} entries for {hosts} hosts",
                jr.cpus.len()
            ));
        }
        jr.cpus_used = unpacker.unpack16_array()?;
        check_per_node_len("cpus_used", jr.cpus_used.len(), hosts)?;
        jr.memory_allocated = unpacker.unpack64_array()?;
        check_per_node_len("memory_allocated", jr.memory_allocated.len(), hosts)?;
        jr.memory_used = unpacker.unpack64_array()?;
        check_per_node_len("memory_used", jr.memory_used.len(), hosts)?;

        jr.sockets_per_node = unpacker.unpack16_array()?;
        jr.cores_per_socket = unpacker.unpack16_array()?;
        jr.sock_core_rep_count = unpacker.unpack32_array()?;
        let runs = jr.sock_core_rep_count.len();
        if jr.sockets_per_node.len() != runs || jr.cores_per_socket.len() != runs {
            return inconsistency(format!(
                "socket/core geometry arrays differ in length ({}, {}, {runs})",
                jr.sockets_per_node.len(),
                jr.cores_per_socket.len()
            ));
        }
        let reps: u64 = jr.sock_core_rep_count.iter().map(|r| *r as u64).sum();
        if reps != nhosts as u64 {
            log::error!("Socket/core repetition count {reps} does not match {nhosts} hosts");
            return inconsistency(format!(
                "sock_core_rep_count sums to {reps}, expected {nhosts}"
            ));
        }

        let core_cnt = jr.geometry_core_count();
        jr.core_bitmap = unpacker.unpack_bitmap_hex()?;
        jr.core_bitmap_used = unpacker.unpack_bitmap_hex()?;
        for bitmap in [jr.core_bitmap.as_ref(), jr.core_bitmap_used.as_ref()]
            .into_iter()
            .flatten()
        {
            if bitmap.len() != core_cnt {
                return inconsistency(format!(
                    "core bitmap has {} bits, geometry describes {core_cnt} cores",
                    bitmap.len()
                ));
            }
        }
        Ok(Some(jr))
    }
}

#[cfg(test)]
mod tests {
    use crate::pack::{Packer, Unpacker};
    use crate::protocol::{MIN_PROTOCOL_VERSION, PREVIOUS_PROTOCOL_VERSION, PROTOCOL_VERSION};
    use crate::resources::{CrType, JobResources};
    use crate::tests::{build_jr, check_invariants, uniform_table};

    fn round_trip(jr: &JobResources, version: u16) -> JobResources {
        let mut packer = Packer::new();
        jr.pack(&mut packer, version).unwrap();
        let data = packer.freeze();
        let mut unpacker = Unpacker::new(&data);
        let result = JobResources::unpack(&mut unpacker, version).unwrap().unwrap();
        assert!(unpacker.is_empty());
        result
    }

    #[test]
    fn pack_and_unpack_keeps_cores() {
        let table = uniform_table(20, 2, 4, 1);
        let mut jr = build_jr(&table, &[2, 5, 12, 16], 8);
        jr.set_bit(0, 1, 2).unwrap();
        jr.core_bitmap_used.as_mut().unwrap().set(6);
        jr.cr_type = CrType::CORE | CrType::MEMORY;
        jr.threads_per_core = 1;
        assert_eq!(jr.core_bitmap.as_ref().unwrap().len(), 32);
        assert!(jr.core_bitmap.as_ref().unwrap().test(6));

        let mut copy = round_trip(&jr, PROTOCOL_VERSION);
        assert!(copy.node_bitmap.is_none());
        copy.reset_node_bitmap(&table).unwrap();
        assert_eq!(copy, jr);
        assert_eq!(copy.sockets_per_node, vec![2]);
        assert_eq!(copy.cores_per_socket, vec![4]);
        assert_eq!(copy.sock_core_rep_count, vec![4]);
        assert!(copy.get_bit(0, 1, 2).unwrap());
        check_invariants(&copy);
    }

    #[test]
    fn previous_version_omits_thread_fields() {
        let table = uniform_table(4, 2, 4, 2);
        let mut jr = build_jr(&table, &[0, 3], 16);
        jr.set_node(1).unwrap();
        jr.threads_per_core = 2;
        jr.cr_type = CrType::CORE;

        let mut new = Packer::new();
        jr.pack(&mut new, PROTOCOL_VERSION).unwrap();
        let mut old = Packer::new();
        jr.pack(&mut old, PREVIOUS_PROTOCOL_VERSION).unwrap();
        assert_eq!(new.len(), old.len() + 4);

        let mut copy = round_trip(&jr, PREVIOUS_PROTOCOL_VERSION);
        assert_eq!(copy.threads_per_core, 0);
        assert_eq!(copy.cr_type, CrType::empty());
        copy.reset_node_bitmap(&table).unwrap();
        copy.threads_per_core = 2;
        copy.cr_type = CrType::CORE;
        assert_eq!(copy, jr);
    }

    #[test]
    fn missing_record_is_no_val() {
        let mut packer = Packer::new();
        JobResources::pack_optional(None, &mut packer, PROTOCOL_VERSION).unwrap();
        let data = packer.freeze();
        assert_eq!(&data[..], &[0xff, 0xff, 0xff, 0xfe]);
        let mut unpacker = Unpacker::new(&data);
        assert!(
            JobResources::unpack(&mut unpacker, PROTOCOL_VERSION)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn empty_record_round_trips() {
        let jr = JobResources::new();
        let copy = round_trip(&jr, MIN_PROTOCOL_VERSION);
        assert_eq!(copy, jr);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let jr = JobResources::new();
        let mut packer = Packer::new();
        assert!(matches!(
            jr.pack(&mut packer, PROTOCOL_VERSION + 1),
            Err(crate::Error::Protocol(_))
        ));
        let mut unpacker = Unpacker::new(&[0, 0, 0, 0]);
        assert!(JobResources::unpack(&mut unpacker, MIN_PROTOCOL_VERSION - 1).is_err());
    }

    #[test]
    fn inconsistent_geometry_is_rejected() {
        let table = uniform_table(4, 2, 4, 1);
        let mut jr = build_jr(&table, &[0, 1], 4);
        jr.sock_core_rep_count = vec![3];
        let mut packer = Packer::new();
        jr.pack(&mut packer, PROTOCOL_VERSION).unwrap();
        let data = packer.freeze();
        let mut unpacker = Unpacker::new(&data);
        assert!(matches!(
            JobResources::unpack(&mut unpacker, PROTOCOL_VERSION),
            Err(crate::Error::Inconsistency(_))
        ));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let table = uniform_table(4, 2, 4, 1);
        let jr = build_jr(&table, &[0, 1], 4);
        let mut packer = Packer::new();
        jr.pack(&mut packer, PROTOCOL_VERSION).unwrap();
        let data = packer.freeze();
        let mut unpacker = Unpacker::new(&data[..data.len() - 3]);
        assert!(matches!(
            JobResources::unpack(&mut unpacker, PROTOCOL_VERSION),
            Err(crate::Error::Protocol(_))
        ));
    }
}
